//! Backend SQLite database handlers for persisting documents.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, bail};
use sqlx::{ConnectOptions, SqlitePool, sqlite::SqliteConnectOptions};

/// Represents a document persisted in database storage.
#[derive(sqlx::FromRow, PartialEq, Eq, Clone, Debug, Default)]
pub struct PersistedDocument {
    /// Text content of the document.
    pub text: String,
    /// Language of the document for editor syntax highlighting.
    pub language: Option<String>,
    /// Access token required to open the document, if protected.
    pub otp: Option<String>,
}

/// A driver for database operations wrapping a pool connection.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
    temp_file: Option<Arc<TempFile>>,
}

/// Path of a temporary database, removed when the last handle drops.
#[derive(Debug)]
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        // Clean up temporary storage files on drop.
        if self.0.parent() != Some(std::env::temp_dir().as_path()) {
            return;
        }
        let _ = std::fs::remove_file(&self.0);
        for suffix in ["-wal", "-shm"] {
            let mut name = self.0.clone().into_os_string();
            name.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(name));
        }
    }
}

impl Database {
    /// Construct a new database from a SQLite connection URI.
    pub async fn new(uri: &str) -> Result<Self> {
        {
            // Create database file if missing, and run migrations.
            let mut conn = SqliteConnectOptions::from_str(uri)?
                .create_if_missing(true)
                .connect()
                .await?;
            sqlx::migrate!().run(&mut conn).await?;
        }
        Ok(Database {
            pool: SqlitePool::connect(uri).await?,
            temp_file: None,
        })
    }

    /// Construct a new database in a temporary file for testing.
    pub async fn temporary() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("kolabpad_{:x}.db", rand::random::<u64>()));
        let mut database = Self::new(&format!("sqlite://{}", path.display())).await?;
        database.temp_file = Some(Arc::new(TempFile(path)));
        Ok(database)
    }

    /// Load a document from the database, or `None` if it was never stored.
    pub async fn load(&self, document_id: &str) -> Result<Option<PersistedDocument>> {
        sqlx::query_as(r#"SELECT text, language, otp FROM document WHERE id = $1"#)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.into())
    }

    /// Load only the access token column of a document.
    ///
    /// This is the cold-document access gate's read path; it must stay cheap
    /// and must not be replaced by a full-row load.
    pub async fn load_otp(&self, document_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as(r#"SELECT otp FROM document WHERE id = $1"#)
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(otp,)| otp))
    }

    /// Store a document in the database, inserting or replacing the row.
    pub async fn store(&self, document_id: &str, document: &PersistedDocument) -> Result<()> {
        let result = sqlx::query(
            r#"
INSERT INTO
    document (id, text, language, otp)
VALUES
    ($1, $2, $3, $4)
ON CONFLICT(id) DO UPDATE SET
    text = excluded.text,
    language = excluded.language,
    otp = excluded.otp"#,
        )
        .bind(document_id)
        .bind(&document.text)
        .bind(&document.language)
        .bind(&document.otp)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            bail!(
                "expected store() to receive 1 row affected, but it affected {} rows instead",
                result.rows_affected(),
            );
        }
        Ok(())
    }

    /// Update only the access token of a stored document.
    pub async fn update_otp(&self, document_id: &str, otp: Option<&str>) -> Result<()> {
        let result = sqlx::query(r#"UPDATE document SET otp = $2 WHERE id = $1"#)
            .bind(document_id)
            .bind(otp)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            bail!("document {} is not in the database", document_id);
        }
        Ok(())
    }

    /// Count the number of documents in the database.
    pub async fn count(&self) -> Result<usize> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM document")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as usize)
    }
}
