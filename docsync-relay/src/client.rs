//! WebSocket sync client for connecting to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - A local Yrs replica kept in sync through the relay
//! - Presence publishing (`{"user": {"name", "color"}, "cursor"}`)
//! - An event stream for the application
//!
//! Edits made while disconnected stay in the local replica. On the next
//! connect the relay's state vector is answered with a catch-up delta, so
//! nothing needs queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use docsync_core::{
    AwarenessTracker, ClientId, ConnectionId, Message, ReplicaStore, SyncMessage, YrsReplica,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;
use yrs::TransactionMut;

use crate::error::RelayError;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:1234";

/// Palette new users pick their color from.
pub const USER_COLORS: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8",
    "#F7DC6F", "#BB8FCE", "#85C1E2", "#F8B88B", "#A8E6CF",
];

const CHANNEL_CAPACITY: usize = 256;

/// Origin tag for presence this client sets itself.
const LOCAL: ConnectionId = ConnectionId(0);
/// Origin tag for presence received from the relay.
const RELAY: ConnectionId = ConnectionId(1);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Local replica has caught up with the relay
    Synced,
    /// A delta from another peer changed the local replica
    RemoteDelta(Vec<u8>),
    /// Presence changed; carries the new user list
    UsersChanged(Vec<CollaborationUser>),
}

/// One entry of [`SyncClient::online_users`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationUser {
    pub id: ClientId,
    pub name: String,
    pub color: String,
    pub cursor: Option<Value>,
}

impl CollaborationUser {
    /// Build from an awareness state. Only states carrying `user` count.
    fn from_state(id: ClientId, state: &Value) -> Option<Self> {
        let user = state.get("user")?;
        let field = |key: &str, default: &str| {
            user.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        Some(Self {
            id,
            name: field("name", "Anonymous"),
            color: field("color", "#000000"),
            cursor: state.get("cursor").filter(|c| !c.is_null()).cloned(),
        })
    }
}

/// State shared with the background reader task.
struct Shared {
    replica: Mutex<YrsReplica>,
    awareness: Mutex<AwarenessTracker>,
    state: RwLock<ConnectionState>,
    synced: AtomicBool,
    /// State vector the relay announced in its handshake.
    server_state_vector: Mutex<Option<Vec<u8>>>,
    client_id: ClientId,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::trace!("Dropping client event: {e}");
        }
    }

    async fn online_users(&self) -> Vec<CollaborationUser> {
        let awareness = self.awareness.lock().await;
        awareness
            .records()
            .filter_map(|(id, record)| CollaborationUser::from_state(id, &record.state))
            .collect()
    }

    async fn handle_frame(&self, frame: &[u8], out_tx: &mpsc::Sender<Vec<u8>>) -> Result<(), RelayError> {
        match Message::decode(frame)? {
            Message::Sync(SyncMessage::StateVector(server_sv)) => {
                let catch_up = self.replica.lock().await.catch_up_delta(&server_sv)?;
                if let Some(delta) = catch_up {
                    let _ = out_tx.send(Message::update(delta).encode()).await;
                }
                *self.server_state_vector.lock().await = Some(server_sv);
                self.check_synced().await;
            }
            Message::Sync(SyncMessage::Update(delta)) => {
                let changed = self.replica.lock().await.apply_delta(&delta)?;
                if changed {
                    self.emit(SyncEvent::RemoteDelta(delta));
                }
                self.check_synced().await;
            }
            Message::Sync(SyncMessage::Request) => {
                let sv = self.replica.lock().await.state_vector();
                let _ = out_tx.send(Message::state_vector(sv).encode()).await;
            }
            Message::Awareness(update) => {
                let change = self.awareness.lock().await.apply_update(&update, RELAY)?;
                if !change.is_empty() {
                    self.emit(SyncEvent::UsersChanged(self.online_users().await));
                }
            }
        }
        Ok(())
    }

    /// Flip to synced once the local replica covers the relay's handshake
    /// state vector.
    async fn check_synced(&self) {
        if self.synced.load(Ordering::Acquire) {
            return;
        }
        let Some(server_sv) = self.server_state_vector.lock().await.clone() else {
            return;
        };
        match self.replica.lock().await.is_behind(&server_sv) {
            Ok(true) => {}
            Ok(false) => {
                if !self.synced.swap(true, Ordering::AcqRel) {
                    log::debug!("Client {} synced", self.client_id);
                    self.emit(SyncEvent::Synced);
                }
            }
            Err(e) => log::warn!("Cannot compare against relay state vector: {e}"),
        }
    }

    /// Idempotent transition to `Disconnected`. Presence of other peers is
    /// dropped; only this client's own state survives.
    async fn mark_disconnected(&self) {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        self.synced.store(false, Ordering::Release);
        *self.server_state_vector.lock().await = None;

        let change = {
            let mut awareness = self.awareness.lock().await;
            let others: Vec<ClientId> = awareness
                .all_client_ids()
                .into_iter()
                .filter(|id| *id != self.client_id)
                .collect();
            awareness.forget_clients(&others)
        };

        self.emit(SyncEvent::Disconnected);
        if !change.is_empty() {
            self.emit(SyncEvent::UsersChanged(self.online_users().await));
        }
    }
}

/// The sync client.
///
/// Keeps a local replica of one document in sync with the relay and
/// publishes this user's presence.
pub struct SyncClient {
    server_url: String,
    document: String,
    username: String,
    color: String,
    shared: Arc<Shared>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client for `document` on the relay at `server_url`
    /// (e.g. `ws://localhost:1234`).
    pub fn new(server_url: impl Into<String>, document: impl Into<String>) -> Self {
        let client_id = u64::from(Uuid::new_v4().as_u128() as u32);
        let username = format!("User-{}", client_id % 1000);
        Self::with_identity(server_url, document, client_id, username)
    }

    /// Create a client with a fixed awareness id and display name.
    pub fn with_identity(
        server_url: impl Into<String>,
        document: impl Into<String>,
        client_id: ClientId,
        username: impl Into<String>,
    ) -> Self {
        let username = username.into();
        let color = USER_COLORS[(client_id % USER_COLORS.len() as u64) as usize].to_string();

        let mut awareness = AwarenessTracker::new();
        awareness.set_state(client_id, user_state(&username, &color), LOCAL);

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            replica: Mutex::new(YrsReplica::new()),
            awareness: Mutex::new(awareness),
            state: RwLock::new(ConnectionState::Disconnected),
            synced: AtomicBool::new(false),
            server_state_vector: Mutex::new(None),
            client_id,
            event_tx,
        });

        Self {
            server_url: server_url.into(),
            document: document.into(),
            username,
            color,
            shared,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            reader: None,
            writer: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Full URL of the document endpoint.
    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.document)
    }

    /// Connect and start the handshake.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(&mut self) -> Result<(), RelayError> {
        if self.outgoing_tx.is_some() {
            log::warn!("Client {} already connected", self.client_id());
            return Ok(());
        }
        *self.shared.state.write().await = ConnectionState::Connecting;

        let url = self.url();
        log::info!("Connecting to {url}");
        let ws = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        self.writer = Some(tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        // Handshake: our state vector, then our presence. Peers may hold a
        // removal marker for our id from a previous connection.
        let sv = self.shared.replica.lock().await.state_vector();
        let presence = {
            let mut awareness = self.shared.awareness.lock().await;
            awareness.renew_state(self.client_id(), LOCAL);
            awareness.encode_changed(&[self.client_id()])
        };
        for frame in [Message::state_vector(sv).encode(), Message::awareness(presence).encode()] {
            out_tx
                .send(frame)
                .await
                .map_err(|_| RelayError::NotConnected(url.clone()))?;
        }

        *self.shared.state.write().await = ConnectionState::Connected;
        self.shared.emit(SyncEvent::Connected);

        // Reader task: apply incoming frames
        let shared = self.shared.clone();
        let reply_tx = out_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => {
                        if let Err(e) = shared.handle_frame(&data, &reply_tx).await {
                            log::warn!("Skipping relay message: {e}");
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            shared.mark_disconnected().await;
        }));

        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    /// Close the connection. Local replica and presence are kept.
    pub async fn disconnect(&mut self) {
        // The reader holds a sender clone; stop it first so the writer
        // sees the channel close.
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        self.shared.mark_disconnected().await;
        log::info!("Client {} disconnected", self.client_id());
    }

    /// Apply a local edit and send the resulting delta.
    ///
    /// Offline edits are kept locally and delivered on the next connect.
    pub async fn edit<F>(&self, f: F) -> Result<Vec<u8>, RelayError>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let delta = self.shared.replica.lock().await.edit(f);
        self.send(Message::update(delta.clone()).encode()).await?;
        Ok(delta)
    }

    /// Read the local replica.
    pub async fn read<R>(&self, f: impl FnOnce(&YrsReplica) -> R) -> R {
        let replica = self.shared.replica.lock().await;
        f(&replica)
    }

    /// Current contents of the root text `name`.
    pub async fn text(&self, name: &str) -> Option<String> {
        self.read(|replica| replica.text(name)).await
    }

    /// Change this user's display name and/or color.
    pub async fn update_user(
        &mut self,
        name: Option<String>,
        color: Option<String>,
    ) -> Result<(), RelayError> {
        if let Some(name) = name {
            self.username = name;
        }
        if let Some(color) = color {
            self.color = color;
        }
        let user = user_state(&self.username, &self.color);
        self.update_local_state(|state| {
            if let Some(user) = user.get("user") {
                state.insert("user".into(), user.clone());
            }
        })
        .await
    }

    /// Publish (or clear, with `None`) this user's cursor.
    pub async fn set_cursor(&self, cursor: Option<Value>) -> Result<(), RelayError> {
        self.update_local_state(|state| match cursor {
            Some(cursor) => {
                state.insert("cursor".into(), cursor);
            }
            None => {
                state.remove("cursor");
            }
        })
        .await
    }

    async fn update_local_state<F>(&self, f: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let client_id = self.client_id();
        let frame = {
            let mut awareness = self.shared.awareness.lock().await;
            let mut state = awareness
                .get(client_id)
                .and_then(|record| record.state.as_object().cloned())
                .unwrap_or_default();
            f(&mut state);
            awareness.set_state(client_id, Value::Object(state), LOCAL);
            Message::awareness(awareness.encode_changed(&[client_id])).encode()
        };
        self.send(frame).await
    }

    /// Send `frame` if connected; a no-op otherwise.
    async fn send(&self, frame: Vec<u8>) -> Result<(), RelayError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| RelayError::NotConnected(self.url())),
            None => Ok(()),
        }
    }

    /// Everyone with a `user` entry in their presence, this client included.
    pub async fn online_users(&self) -> Vec<CollaborationUser> {
        self.shared.online_users().await
    }

    /// This client as it appears in [`online_users`](Self::online_users).
    pub fn current_user(&self) -> CollaborationUser {
        CollaborationUser {
            id: self.client_id(),
            name: self.username.clone(),
            color: self.color.clone(),
            cursor: None,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Acquire)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn user_state(name: &str, color: &str) -> Value {
    serde_json::json!({ "user": { "name": name, "color": color } })
}
