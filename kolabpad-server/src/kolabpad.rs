//! Eventually consistent server-side logic for Kolabpad.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use operational_transform::OperationSeq;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, broadcast};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::database::PersistedDocument;
use crate::ot::transform_index;

/// Reserved id for operations and broadcasts synthesized by the server.
///
/// Lies above every id handed out by the per-document counter, so clients can
/// always tell server-authored history apart from user edits.
pub const SYSTEM_USER_ID: u64 = u64::MAX;

/// Tunable per-document limits, shared by every document on the server.
#[derive(Clone, Debug)]
pub struct DocumentConfig {
    /// Upper bound on the length of the document, in Unicode codepoints.
    pub max_document_size: usize,
    /// A connection is dropped after this long without an inbound message.
    pub read_timeout: Duration,
    /// An outbound send that takes longer than this is fatal to the session.
    pub write_timeout: Duration,
    /// Capacity of each session's metadata mailbox.
    pub broadcast_buffer: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_document_size: 256 * 1024,
            read_timeout: Duration::from_secs(30 * 60),
            write_timeout: Duration::from_secs(10),
            broadcast_buffer: 16,
        }
    }
}

/// The main object representing a collaborative document.
pub struct Kolabpad {
    /// State modified by critical sections of the code.
    state: RwLock<State>,
    /// Incremented to obtain unique user IDs.
    count: AtomicU64,
    /// Used to notify clients of new text operations.
    notify: Notify,
    /// Used to inform all clients of metadata updates.
    update: broadcast::Sender<ServerMsg>,
    /// Set to true when the document is destroyed.
    killed: AtomicBool,
    /// Reference point for the lock-free timestamps below.
    epoch: Instant,
    /// Milliseconds after `epoch` of the last applied edit.
    last_edit: AtomicU64,
    /// Milliseconds after `epoch`, plus one, of the last synchronous store
    /// write. Zero means no critical write has happened.
    last_critical_write: AtomicU64,
    /// Highest revision known to have reached the store.
    last_persisted: AtomicU64,
    /// Limits applied to connections and edits.
    config: DocumentConfig,
}

/// Shared state involving multiple users, protected by a lock.
#[derive(Default)]
struct State {
    operations: Vec<UserOperation>,
    text: String,
    language: Option<String>,
    otp: Option<String>,
    users: HashMap<u64, UserInfo>,
    cursors: HashMap<u64, CursorData>,
}

impl Kolabpad {
    pub fn new(config: DocumentConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_buffer);
        Self {
            state: Default::default(),
            count: Default::default(),
            notify: Default::default(),
            update: tx,
            killed: AtomicBool::new(false),
            epoch: Instant::now(),
            last_edit: Default::default(),
            last_critical_write: Default::default(),
            last_persisted: Default::default(),
            config,
        }
    }

    /// Rehydrate a document from its stored row.
    ///
    /// The history starts with a single server-authored insert of the full
    /// text, so the revision and the text length stay consistent without
    /// exposing any prior editing history.
    pub async fn load(document: PersistedDocument, config: DocumentConfig) -> Self {
        let mut operation = OperationSeq::default();
        operation.insert(&document.text);

        let kolabpad = Self::new(config);
        {
            let mut state = kolabpad.state.write().await;
            state.text = document.text;
            state.language = document.language;
            state.otp = document.otp;
            state.operations.push(UserOperation {
                id: SYSTEM_USER_ID,
                operation,
            });
        }
        kolabpad
    }

    /// Returns a snapshot of the latest text.
    pub async fn text(&self) -> String {
        let state = self.state.read().await;
        state.text.clone()
    }

    /// Returns a snapshot of the current document for persistence.
    pub async fn snapshot(&self) -> PersistedDocument {
        let state = self.state.read().await;
        PersistedDocument {
            text: state.text.clone(),
            language: state.language.clone(),
            otp: state.otp.clone(),
        }
    }

    /// Returns the current revision.
    pub async fn revision(&self) -> usize {
        let state = self.state.read().await;
        state.operations.len()
    }

    /// Returns the current access token, if the document is protected.
    pub async fn otp(&self) -> Option<String> {
        let state = self.state.read().await;
        state.otp.clone()
    }

    /// Returns whether the given user is connected and has announced itself.
    pub async fn has_user(&self, id: u64) -> bool {
        let state = self.state.read().await;
        state.users.contains_key(&id)
    }

    /// Set or clear the document's access token and broadcast the change.
    ///
    /// Callers must have already written the new token to the store; this
    /// stamps the critical-write timestamp so the persister backs off instead
    /// of immediately overwriting the freshly written row.
    pub async fn set_otp(&self, otp: Option<String>, user_id: u64, user_name: String) {
        {
            let mut state = self.state.write().await;
            state.otp = otp.clone();
        }
        self.last_critical_write
            .store(self.elapsed_ms() + 1, Ordering::Relaxed);
        self.update
            .send(ServerMsg::Otp {
                otp,
                user_id,
                user_name,
            })
            .ok();
    }

    /// Kill this object immediately, dropping all current connections.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Returns if this Kolabpad object has been killed.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Time since the last applied edit, without taking the document lock.
    pub fn since_last_edit(&self) -> Duration {
        let last_edit = Duration::from_millis(self.last_edit.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last_edit)
    }

    /// Time since the last synchronous store write, or `None` if there has
    /// not been one.
    pub fn since_critical_write(&self) -> Option<Duration> {
        match self.last_critical_write.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(
                self.epoch
                    .elapsed()
                    .saturating_sub(Duration::from_millis(ms - 1)),
            ),
        }
    }

    /// Highest revision known to have reached the store.
    pub fn last_persisted_revision(&self) -> usize {
        self.last_persisted.load(Ordering::Relaxed) as usize
    }

    /// Record that `revision` has been successfully written to the store.
    pub fn set_last_persisted_revision(&self, revision: usize) {
        self.last_persisted.store(revision as u64, Ordering::Relaxed);
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Handle a connection from a WebSocket.
    pub async fn on_connection(&self, mut socket: WebSocket) {
        let id = self.count.fetch_add(1, Ordering::Relaxed);
        info!("connection! id = {}", id);
        if let Err(e) = self.handle_connection(id, &mut socket).await {
            warn!("connection terminated early: {}", e);
        }
        info!("disconnection, id = {}", id);
        socket.send(Message::Close(None)).await.ok();
        self.remove_user(id).await;
    }

    async fn handle_connection(&self, id: u64, socket: &mut WebSocket) -> Result<()> {
        let mut update_rx = self.update.subscribe();

        let mut revision = self.send_initial(id, socket).await?;
        let mut deadline = Instant::now() + self.config.read_timeout;

        loop {
            // In order to avoid the "lost wakeup" problem, we first request a
            // notification, **then** check the current state for new revisions.
            // This is the same approach that `tokio::sync::watch` takes.
            let notified = self.notify.notified();
            if self.killed() {
                break;
            }
            if self.revision().await > revision {
                revision = self.send_history(revision, socket).await?;
            }

            tokio::select! {
                _ = notified => {}
                update = update_rx.recv() => {
                    match update {
                        Ok(msg) => self.send(socket, msg).await?,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Slow consumers lose metadata updates, not edits.
                            warn!("connection {} dropped {} metadata updates", id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                result = socket.next() => {
                    match result {
                        None => break,
                        Some(message) => {
                            deadline = Instant::now() + self.config.read_timeout;
                            self.handle_message(id, message?).await?;
                        }
                    }
                }
                _ = time::sleep_until(deadline) => {
                    bail!("no message received in {:?}", self.config.read_timeout);
                }
            }
        }

        Ok(())
    }

    async fn send(&self, socket: &mut WebSocket, msg: ServerMsg) -> Result<()> {
        time::timeout(self.config.write_timeout, socket.send(msg.into()))
            .await
            .context("write timed out")??;
        Ok(())
    }

    async fn send_initial(&self, id: u64, socket: &mut WebSocket) -> Result<usize> {
        self.send(socket, ServerMsg::Identity(id)).await?;
        let mut messages = Vec::new();
        let revision = {
            let state = self.state.read().await;
            if !state.operations.is_empty() {
                messages.push(ServerMsg::History {
                    start: 0,
                    operations: state.operations.clone(),
                });
            }
            if let Some(language) = &state.language {
                messages.push(ServerMsg::Language {
                    language: language.clone(),
                    user_id: SYSTEM_USER_ID,
                    user_name: String::new(),
                });
            }
            for (&id, info) in &state.users {
                messages.push(ServerMsg::UserInfo {
                    id,
                    info: Some(info.clone()),
                });
            }
            for (&id, data) in &state.cursors {
                messages.push(ServerMsg::UserCursor {
                    id,
                    data: data.clone(),
                });
            }
            if let Some(otp) = &state.otp {
                messages.push(ServerMsg::Otp {
                    otp: Some(otp.clone()),
                    user_id: SYSTEM_USER_ID,
                    user_name: String::new(),
                });
            }
            state.operations.len()
        };
        for msg in messages {
            self.send(socket, msg).await?;
        }
        Ok(revision)
    }

    async fn send_history(&self, start: usize, socket: &mut WebSocket) -> Result<usize> {
        let operations = {
            let state = self.state.read().await;
            let len = state.operations.len();
            if start < len {
                state.operations[start..].to_owned()
            } else {
                Vec::new()
            }
        };
        let num_ops = operations.len();
        if num_ops > 0 {
            let msg = ServerMsg::History { start, operations };
            self.send(socket, msg).await?;
        }
        Ok(start + num_ops)
    }

    async fn handle_message(&self, id: u64, message: Message) -> Result<()> {
        let Message::Text(text) = message else {
            return Ok(()); // ignore pings and close frames
        };
        let msg: ClientMsg =
            serde_json::from_str(&text).context("failed to deserialize message")?;
        match msg {
            ClientMsg::Edit {
                revision,
                operation,
            } => {
                self.apply_edit(id, revision, operation)
                    .await
                    .context("invalid edit operation")?;
                self.notify.notify_waiters();
            }
            ClientMsg::SetLanguage(language) => {
                let user_name = {
                    let mut state = self.state.write().await;
                    state.language = Some(language.clone());
                    state
                        .users
                        .get(&id)
                        .map(|info| info.name.clone())
                        .unwrap_or_default()
                };
                self.update
                    .send(ServerMsg::Language {
                        language,
                        user_id: id,
                        user_name,
                    })
                    .ok();
            }
            ClientMsg::ClientInfo(info) => {
                let info = UserInfo {
                    hue: info.hue % 360,
                    ..info
                };
                self.state.write().await.users.insert(id, info.clone());
                let msg = ServerMsg::UserInfo {
                    id,
                    info: Some(info),
                };
                self.update.send(msg).ok();
            }
            ClientMsg::CursorData(data) => {
                self.state.write().await.cursors.insert(id, data.clone());
                let msg = ServerMsg::UserCursor { id, data };
                self.update.send(msg).ok();
            }
        }
        Ok(())
    }

    async fn apply_edit(&self, id: u64, revision: usize, mut operation: OperationSeq) -> Result<()> {
        info!(
            "edit: id = {}, revision = {}, base_len = {}, target_len = {}",
            id,
            revision,
            operation.base_len(),
            operation.target_len()
        );
        let mut state = self.state.write().await;
        let len = state.operations.len();
        if revision > len {
            bail!("got revision {}, but current is {}", revision, len);
        }
        for history_op in &state.operations[revision..] {
            operation = operation.transform(&history_op.operation)?.0;
        }
        if operation.target_len() > self.config.max_document_size {
            bail!(
                "target length {} exceeds the maximum of {}",
                operation.target_len(),
                self.config.max_document_size
            );
        }
        let new_text = operation.apply(&state.text)?;
        for (_, data) in state.cursors.iter_mut() {
            for cursor in data.cursors.iter_mut() {
                *cursor = transform_index(&operation, *cursor);
            }
            for (start, end) in data.selections.iter_mut() {
                *start = transform_index(&operation, *start);
                *end = transform_index(&operation, *end);
            }
        }
        state.operations.push(UserOperation { id, operation });
        state.text = new_text;
        self.last_edit.store(self.elapsed_ms(), Ordering::Relaxed);
        Ok(())
    }

    async fn remove_user(&self, id: u64) {
        {
            let mut state = self.state.write().await;
            state.users.remove(&id);
            state.cursors.remove(&id);
        }
        self.update.send(ServerMsg::UserInfo { id, info: None }).ok();
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserOperation {
    pub id: u64,
    pub operation: OperationSeq,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub hue: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CursorData {
    pub cursors: Vec<u32>,
    pub selections: Vec<(u32, u32)>,
}

/// A message received from the client over WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientMsg {
    /// Represents a sequence of local edits from the user.
    Edit {
        revision: usize,
        operation: OperationSeq,
    },
    /// Sets the language of the editor.
    SetLanguage(String),
    /// Sets the user's current information.
    ClientInfo(UserInfo),
    /// Sets the user's cursor and selection positions.
    CursorData(CursorData),
}

/// A message sent to the client over WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ServerMsg {
    /// Informs the client of their unique socket ID.
    Identity(u64),
    /// Broadcasts text operations to all clients.
    History {
        start: usize,
        operations: Vec<UserOperation>,
    },
    /// Broadcasts the current language, last writer wins.
    Language {
        language: String,
        user_id: u64,
        user_name: String,
    },
    /// Broadcasts a change to the document's access token.
    #[serde(rename = "OTP")]
    Otp {
        otp: Option<String>,
        user_id: u64,
        user_name: String,
    },
    /// Broadcasts a user's information, or `None` on disconnect.
    UserInfo { id: u64, info: Option<UserInfo> },
    /// Broadcasts a user's cursor position.
    UserCursor { id: u64, data: CursorData },
}

impl From<ServerMsg> for Message {
    fn from(msg: ServerMsg) -> Self {
        let serialized = serde_json::to_string(&msg).expect("failed serialize");
        Message::text(serialized)
    }
}
