//! Server backend for the Kolabpad collaborative text editor.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as base64engine;
use dashmap::DashMap;
use futures::future;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::database::Database;
use crate::kolabpad::Kolabpad;

pub mod database;
mod kolabpad;
mod ot;

pub use kolabpad::DocumentConfig;

/// Extra frame size allowed beyond the document limit, for JSON encoding
/// overhead and batched histories.
const FRAME_OVERHEAD: usize = 64 * 1024;

/// How often an active document is checked for unpersisted changes.
const PERSIST_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// A dirty document is written once no edit has arrived for this long.
const IDLE_WRITE_THRESHOLD: Duration = Duration::from_secs(30);

/// A dirty document is written regardless of activity after this long.
const SAFETY_NET_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Skip the periodic write this close after a synchronous store write.
const CRITICAL_WRITE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Wall-clock bound on flushing all documents during graceful shutdown.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for a document.
#[repr(align(64))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Self::MAX_LEN]);
impl Identifier {
    /// Maximum length of a document ID, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
    }
}
impl FromStr for Identifier {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("Document ID is empty");
        }
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("Document ID is too long");
        }
        if !s.chars().all(Self::valid_char) {
            anyhow::bail!("Document ID contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}
impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        std::str::from_utf8(&self.0[..len]).expect("Document ID contains invalid UTF-8")
    }
}
impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
impl serde::Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}
impl<'de> serde::Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Server configuration, parsed from environment variables.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Number of days after which idle documents are evicted from memory.
    pub expiry_days: u32,
    /// How often the eviction pass runs.
    pub cleanup_interval: Duration,
    /// Database for document persistence, if enabled.
    pub database: Option<Database>,
    /// Limits applied to every document.
    pub document: DocumentConfig,
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    pub async fn from_env() -> anyhow::Result<Self> {
        let expiry_days = std::env::var("EXPIRY_DAYS")
            .unwrap_or_else(|_| String::from("7"))
            .parse()
            .context("Unable to parse EXPIRY_DAYS")?;
        let cleanup_hours: u64 = std::env::var("CLEANUP_INTERVAL_HOURS")
            .unwrap_or_else(|_| String::from("1"))
            .parse()
            .context("Unable to parse CLEANUP_INTERVAL_HOURS")?;
        let max_document_size_kb: usize = std::env::var("MAX_DOCUMENT_SIZE_KB")
            .unwrap_or_else(|_| String::from("256"))
            .parse()
            .context("Unable to parse MAX_DOCUMENT_SIZE_KB")?;
        let read_timeout_minutes: u64 = std::env::var("WS_READ_TIMEOUT_MINUTES")
            .unwrap_or_else(|_| String::from("30"))
            .parse()
            .context("Unable to parse WS_READ_TIMEOUT_MINUTES")?;
        let write_timeout_seconds: u64 = std::env::var("WS_WRITE_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| String::from("10"))
            .parse()
            .context("Unable to parse WS_WRITE_TIMEOUT_SECONDS")?;
        let broadcast_buffer = std::env::var("BROADCAST_BUFFER_SIZE")
            .unwrap_or_else(|_| String::from("16"))
            .parse()
            .context("Unable to parse BROADCAST_BUFFER_SIZE")?;
        let database = match std::env::var("SQLITE_URI") {
            Ok(uri) => Some(Database::new(&uri).await?),
            Err(_) => None,
        };
        Ok(Self {
            expiry_days,
            cleanup_interval: Duration::from_secs(cleanup_hours * 3600),
            database,
            document: DocumentConfig {
                max_document_size: max_document_size_kb * 1024,
                read_timeout: Duration::from_secs(read_timeout_minutes * 60),
                write_timeout: Duration::from_secs(write_timeout_seconds),
                broadcast_buffer,
            },
        })
    }

    /// Construct a configuration with a temporary database for testing.
    pub async fn temporary() -> anyhow::Result<Self> {
        Ok(Self {
            expiry_days: 7,
            cleanup_interval: Duration::from_secs(3600),
            database: Some(Database::temporary().await?),
            document: DocumentConfig::default(),
        })
    }
}

/// An entry in the global document registry.
///
/// Each entry corresponds to a single resident document. Entries are created
/// lazily on first access and destroyed by the eviction pass or by graceful
/// shutdown; dropping one kills the document and stops its persister.
struct Document {
    last_accessed: Instant,
    kolabpad: Arc<Kolabpad>,
    connections: usize,
    persister: Option<JoinHandle<()>>,
}

impl Document {
    fn new(kolabpad: Arc<Kolabpad>) -> Self {
        Self {
            last_accessed: Instant::now(),
            kolabpad,
            connections: 0,
            persister: None,
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        self.kolabpad.kill();
        if let Some(persister) = self.persister.take() {
            persister.abort();
        }
    }
}

/// The shared state of the server, accessible from within request handlers.
pub struct ServerState {
    /// Concurrent map storing in-memory documents.
    documents: DashMap<Identifier, Document>,
    /// The configuration this server was started with.
    config: ServerConfig,
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    start_time: u64,
    num_documents: usize,
    database_size: usize,
}

#[derive(Debug)]
struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Application error: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong").into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ServerState {
    /// Construct the server state from a configuration.
    pub fn new(config: ServerConfig) -> Self {
        let start_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime returned before UNIX_EPOCH")
            .as_secs();
        Self {
            documents: Default::default(),
            config,
            start_time,
        }
    }

    /// Construct a server state with a temporary database for testing.
    pub async fn temporary() -> anyhow::Result<Self> {
        Ok(Self::new(ServerConfig::temporary().await?))
    }

    /// Check a provided access token against the document's, without loading
    /// the document into memory if it is cold.
    async fn check_otp(&self, id: &Identifier, provided: Option<&str>) -> bool {
        if let Some(entry) = self.documents.get(id) {
            let kolabpad = Arc::clone(&entry.kolabpad);
            drop(entry);
            return match kolabpad.otp().await {
                Some(otp) => provided == Some(otp.as_str()),
                None => true,
            };
        }
        if let Some(database) = &self.config.database {
            return match database.load_otp(id.as_ref()).await {
                Ok(Some(otp)) => provided == Some(otp.as_str()),
                Ok(None) => true,
                Err(e) => {
                    error!("failed to read access token for {}: {}", id, e);
                    false
                }
            };
        }
        true
    }

    /// Look up a resident document without creating it.
    fn resident(&self, id: &Identifier) -> Option<Arc<Kolabpad>> {
        self.documents
            .get(id)
            .map(|entry| Arc::clone(&entry.kolabpad))
    }

    /// Register a new connection, creating and loading the document if it is
    /// not resident. The first connection starts the document's persister.
    async fn attach(&self, id: &Identifier) -> Arc<Kolabpad> {
        use dashmap::mapref::entry::Entry;

        let mut entry = match self.documents.entry(id.clone()) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(e) => {
                let kolabpad = self.load_document(id).await;
                e.insert(Document::new(kolabpad))
            }
        };
        let document = entry.value_mut();
        document.last_accessed = Instant::now();
        document.connections += 1;
        let kolabpad = Arc::clone(&document.kolabpad);
        if document.connections == 1
            && let Some(database) = &self.config.database
        {
            document.persister = Some(tokio::spawn(persister(
                id.clone(),
                Arc::clone(&kolabpad),
                database.clone(),
            )));
        }
        kolabpad
    }

    /// Unregister a connection. When the last one leaves, the document is
    /// flushed to the store and its persister is stopped.
    async fn detach(&self, id: &Identifier) {
        let stopped = {
            let Some(mut entry) = self.documents.get_mut(id) else {
                return; // already evicted or drained
            };
            let document = entry.value_mut();
            document.connections = document.connections.saturating_sub(1);
            if document.connections == 0 {
                document
                    .persister
                    .take()
                    .map(|persister| (persister, Arc::clone(&document.kolabpad)))
            } else {
                None
            }
        };
        if let Some((persister, kolabpad)) = stopped {
            if let Some(database) = &self.config.database {
                flush_document(database, id, &kolabpad).await;
            }
            persister.abort();
        }
    }

    async fn load_document(&self, id: &Identifier) -> Arc<Kolabpad> {
        let config = self.config.document.clone();
        if let Some(database) = &self.config.database {
            match database.load(id.as_ref()).await {
                Ok(Some(document)) => {
                    info!("loading document {} from the database", id);
                    return Arc::new(Kolabpad::load(document, config).await);
                }
                Ok(None) => {}
                Err(e) => error!("failed to load document {}: {}", id, e),
            }
        }
        Arc::new(Kolabpad::new(config))
    }

    /// Flush all resident documents in parallel and kill them.
    ///
    /// Runs on graceful shutdown, bounded by a hard wall-clock timeout after
    /// which remaining documents are killed without a completed flush.
    pub async fn drain(&self) {
        let keys: Vec<Identifier> = self
            .documents
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut flushes = Vec::new();
        for key in keys {
            if let Some((id, document)) = self.documents.remove(&key) {
                let database = self.config.database.clone();
                flushes.push(async move {
                    if let Some(database) = database {
                        flush_document(&database, &id, &document.kolabpad).await;
                    }
                    // Dropping the entry kills the document.
                });
            }
        }
        if time::timeout(SHUTDOWN_FLUSH_TIMEOUT, future::join_all(flushes))
            .await
            .is_err()
        {
            error!(
                "graceful flush did not finish within {:?}",
                SHUTDOWN_FLUSH_TIMEOUT
            );
        }
    }
}

/// A router handling all server routes, including WebSocket handlers.
pub fn server(state: Arc<ServerState>) -> Router {
    tokio::spawn(cleaner(Arc::clone(&state)));
    Router::new()
        .route("/api/socket/{id}", get(socket_handler))
        .route("/api/text/{id}", get(text_handler))
        .route("/api/stats", get(stats_handler))
        .route(
            "/api/document/{id}/protect",
            post(protect_handler).delete(unprotect_handler),
        )
        .fallback_service(ServeDir::new("dist"))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    otp: Option<String>,
}

/// Handler for the `/api/socket/{id}` endpoint.
async fn socket_handler(
    Path(id): Path<Identifier>,
    Query(query): Query<SocketQuery>,
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("socket connection for id = {}", id);
    if !state.check_otp(&id, query.otp.as_deref()).await {
        return (StatusCode::UNAUTHORIZED, "incorrect document code").into_response();
    }
    ws.max_message_size(state.config.document.max_document_size + FRAME_OVERHEAD)
        .on_upgrade(move |socket| async move {
            let kolabpad = state.attach(&id).await;
            kolabpad.on_connection(socket).await;
            state.detach(&id).await;
        })
}

/// Handler for the `/api/text/{id}` endpoint.
async fn text_handler(
    Path(id): Path<Identifier>,
    Query(query): Query<SocketQuery>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if !state.check_otp(&id, query.otp.as_deref()).await {
        return (StatusCode::UNAUTHORIZED, "incorrect document code").into_response();
    }
    match state.resident(&id) {
        Some(kolabpad) => kolabpad.text().await.into_response(),
        None => match &state.config.database {
            Some(database) => database
                .load(id.as_ref())
                .await
                .ok()
                .flatten()
                .map(|document| document.text)
                .unwrap_or_default()
                .into_response(),
            None => String::new().into_response(),
        },
    }
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(State(state): State<Arc<ServerState>>) -> Result<Response, AppError> {
    let num_documents = state.documents.len();
    let database_size = match &state.config.database {
        Some(database) => database.count().await?,
        None => 0,
    };
    Ok(Json(Stats {
        start_time: state.start_time,
        num_documents,
        database_size,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
struct ProtectRequest {
    user_id: u64,
    user_name: String,
}

#[derive(Debug, Serialize)]
struct ProtectResponse {
    otp: String,
}

/// Generate a fresh document access token: 9 bytes from a cryptographically
/// secure source, URL-safe base64 encoded into 12 characters.
fn generate_otp() -> String {
    base64engine.encode(rand::random::<[u8; 9]>())
}

/// Handler for `POST /api/document/{id}/protect`.
async fn protect_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ProtectRequest>,
) -> Result<Response, AppError> {
    let Some(database) = &state.config.database else {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, "persistence is disabled").into_response());
    };
    let Some(kolabpad) = state.resident(&id) else {
        return Ok((StatusCode::FORBIDDEN, "document is not open").into_response());
    };
    if !kolabpad.has_user(request.user_id).await {
        return Ok((StatusCode::FORBIDDEN, "not a user of this document").into_response());
    }
    let otp = generate_otp();
    let mut document = kolabpad.snapshot().await;
    document.otp = Some(otp.clone());
    // The token must be durable before anyone can observe it.
    database.store(id.as_ref(), &document).await?;
    info!("protected document {}", id);
    kolabpad
        .set_otp(Some(otp.clone()), request.user_id, request.user_name)
        .await;
    Ok(Json(ProtectResponse { otp }).into_response())
}

#[derive(Debug, Deserialize)]
struct UnprotectRequest {
    user_id: u64,
    user_name: String,
    otp: String,
}

/// Handler for `DELETE /api/document/{id}/protect`.
async fn unprotect_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<UnprotectRequest>,
) -> Result<Response, AppError> {
    let Some(database) = &state.config.database else {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, "persistence is disabled").into_response());
    };
    let Some(kolabpad) = state.resident(&id) else {
        return Ok((StatusCode::FORBIDDEN, "document is not open").into_response());
    };
    if !kolabpad.has_user(request.user_id).await {
        return Ok((StatusCode::FORBIDDEN, "not a user of this document").into_response());
    }
    let Some(current) = kolabpad.otp().await else {
        return Ok((StatusCode::BAD_REQUEST, "document is not protected").into_response());
    };
    if request.otp != current {
        return Ok((StatusCode::FORBIDDEN, "incorrect document code").into_response());
    }
    database.update_otp(id.as_ref(), None).await?;
    info!("unprotected document {}", id);
    kolabpad
        .set_otp(None, request.user_id, request.user_name)
        .await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Reclaims memory for documents that have not been accessed in a long time.
async fn cleaner(state: Arc<ServerState>) {
    let expiry = Duration::from_secs(3600) * 24 * state.config.expiry_days;
    loop {
        time::sleep(state.config.cleanup_interval).await;
        let mut keys = Vec::new();
        for entry in state.documents.iter() {
            if entry.last_accessed.elapsed() > expiry {
                keys.push(entry.key().clone());
            }
        }
        info!("cleaner removing keys: {:?}", keys);
        for key in keys {
            if let Some((id, document)) = state.documents.remove(&key) {
                if let Some(database) = &state.config.database {
                    flush_document(database, &id, &document.kolabpad).await;
                }
                // Dropping the entry kills the document and its persister.
            }
        }
    }
}

/// Write a document to the store unless it has nothing worth keeping.
///
/// Empty, unprotected documents are never written.
async fn flush_document(database: &Database, id: &Identifier, kolabpad: &Kolabpad) {
    let revision = kolabpad.revision().await;
    let document = kolabpad.snapshot().await;
    if revision == 0 && document.otp.is_none() {
        return;
    }
    info!("flushing revision {} for id = {}", revision, id);
    if let Err(e) = database.store(id.as_ref(), &document).await {
        error!("when flushing document {}: {}", id, e);
    } else {
        kolabpad.set_last_persisted_revision(revision);
    }
}

/// Lazily persists a document while it has active connections.
///
/// A write happens once edits have been idle past a threshold, with a safety
/// net for documents that never go idle. Writes shortly after a synchronous
/// store write are debounced so the fresher row is not clobbered.
async fn persister(id: Identifier, kolabpad: Arc<Kolabpad>, database: Database) {
    let mut last_persist = Instant::now();
    while !kolabpad.killed() {
        time::sleep(PERSIST_CHECK_INTERVAL).await;
        let revision = kolabpad.revision().await;
        if revision <= kolabpad.last_persisted_revision() {
            continue;
        }
        if let Some(elapsed) = kolabpad.since_critical_write()
            && elapsed < CRITICAL_WRITE_DEBOUNCE
        {
            continue;
        }
        let idle = kolabpad.since_last_edit() >= IDLE_WRITE_THRESHOLD;
        let overdue = last_persist.elapsed() >= SAFETY_NET_INTERVAL;
        if !idle && !overdue {
            continue;
        }
        info!("persisting revision {} for id = {}", revision, id);
        match database.store(id.as_ref(), &kolabpad.snapshot().await).await {
            Ok(()) => {
                kolabpad.set_last_persisted_revision(revision);
                last_persist = Instant::now();
            }
            Err(e) => error!("when persisting document {}: {}", id, e),
        }
    }
}
