//! Per-connection protocol state machine.
//!
//! ```text
//! Connecting ──attach──► Attached ──close──► Closed
//! ```
//!
//! [`Connection`] holds no document state; it routes inbound frames to
//! its session and pulls outbound frames from its subscription. The socket
//! loop in [`run`] drives it: one task per connection, inbound frames in
//! arrival order, broadcasts written as they arrive.

use std::sync::Arc;

use bytes::Bytes;
use docsync_core::{ConnectionId, Message, ProtocolError};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{RecvError, Subscription};
use crate::registry::DocumentRegistry;
use crate::server::StatsCounters;
use crate::session::DocumentSession;

/// Lifecycle of one connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Attached,
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    document: String,
    state: ConnectionState,
    max_message_size: usize,
    session: Option<Arc<DocumentSession>>,
    subscription: Option<Subscription>,
}

impl Connection {
    pub fn new(id: ConnectionId, document: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            id,
            document: document.into(),
            state: ConnectionState::Connecting,
            max_message_size,
            session: None,
            subscription: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `Connecting → Attached`. Returns the handshake frames to send:
    /// the session's state vector, then the presence snapshot if non-empty.
    pub async fn attach(&mut self, registry: &DocumentRegistry) -> Vec<Vec<u8>> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        let (session, attachment) = registry.attach(&self.document, self.id).await;
        let mut frames = vec![attachment.sync_step1];
        frames.extend(attachment.awareness);

        self.session = Some(session);
        self.subscription = Some(attachment.subscription);
        self.state = ConnectionState::Attached;
        frames
    }

    /// Process one inbound frame and return a direct reply, if any.
    ///
    /// Malformed or unmergeable messages are logged and dropped; the
    /// connection stays attached.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.state != ConnectionState::Attached {
            return None;
        }
        let session = self.session.as_ref()?;

        if frame.len() > self.max_message_size {
            let err = ProtocolError::MessageTooLarge {
                size: frame.len(),
                limit: self.max_message_size,
            };
            log::warn!("{} on '{}': {err}", self.id, self.document);
            return None;
        }

        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed message from {} on '{}': {e}", self.id, self.document);
                return None;
            }
        };
        log::trace!("{} -> '{}': {:?}", self.id, self.document, msg.kind());

        let result = match msg {
            Message::Sync(sync) => session.handle_sync(self.id, sync).await,
            Message::Awareness(update) => session
                .handle_awareness(self.id, &update)
                .await
                .map(|_| None),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Skipping message from {} on '{}': {e}", self.id, self.document);
                None
            }
        }
    }

    /// Next frame another peer caused. Never resolves before attach.
    pub async fn next_broadcast(&mut self) -> Result<Bytes, RecvError> {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Transition to `Closed`: leave the peer set, drop owned presence
    /// (broadcasting the removal) and release the subscription.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        if let (Some(session), Some(subscription)) = (self.session.take(), self.subscription.take()) {
            let left = session.detach(subscription).await;
            log::info!("{} left '{}' ({left} peers remain)", self.id, self.document);
        }
    }
}

/// Drive `conn` over an accepted websocket until either side closes.
pub(crate) async fn run<S>(
    ws: WebSocketStream<S>,
    mut conn: Connection,
    registry: Arc<DocumentRegistry>,
    stats: Arc<StatsCounters>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();

    for frame in conn.attach(&registry).await {
        if let Err(e) = ws_sender.send(WsMessage::Binary(frame.into())).await {
            log::debug!("Handshake send to {} failed: {e}", conn.id());
            conn.close().await;
            return;
        }
    }
    log::info!("{} attached to '{}'", conn.id(), conn.document());

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        stats.record_message(data.len());
                        if let Some(reply) = conn.handle_frame(&data).await {
                            if let Err(e) = ws_sender.send(WsMessage::Binary(reply.into())).await {
                                log::debug!("Send to {} failed: {e}", conn.id());
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Text(_))) => {
                        log::debug!("Ignoring text frame from {}", conn.id());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket error on {}: {e}", conn.id());
                        break;
                    }
                }
            }

            frame = conn.next_broadcast() => {
                match frame {
                    Ok(payload) => {
                        if let Err(e) = ws_sender.send(WsMessage::Binary(payload)).await {
                            log::debug!("Forward to {} failed: {e}", conn.id());
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("{} fell {n} frames behind on '{}', disconnecting", conn.id(), conn.document());
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    conn.close().await;
    let _ = ws_sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::awareness::encode_update;
    use docsync_core::{AwarenessEntry, ReplicaStore, SyncMessage, YrsReplica};
    use serde_json::json;
    use yrs::{Text, WriteTxn};

    const MAX: usize = 1 << 20;

    fn delta(text: &str) -> Vec<u8> {
        YrsReplica::new().edit(|txn| {
            let t = txn.get_or_insert_text("content");
            t.insert(txn, 0, text);
        })
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let registry = DocumentRegistry::new(16);
        let mut conn = Connection::new(ConnectionId(1), "doc-1", MAX);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let frames = conn.attach(&registry).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(conn.state(), ConnectionState::Attached);
        assert_eq!(registry.get("doc-1").await.unwrap().peer_count().await, 1);

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(registry.get("doc-1").await.unwrap().peer_count().await, 0);

        // Closed never reverts
        assert!(conn.attach(&registry).await.is_empty());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_frames_ignored_before_attach() {
        let mut conn = Connection::new(ConnectionId(1), "doc", MAX);
        assert!(conn.handle_frame(&Message::request().encode()).await.is_none());
    }

    #[tokio::test]
    async fn test_handshake_includes_presence_snapshot() {
        let registry = DocumentRegistry::new(16);
        let mut a = Connection::new(ConnectionId(1), "doc", MAX);
        a.attach(&registry).await;
        let presence = encode_update(&[AwarenessEntry {
            client_id: 11,
            clock: 0,
            state: Some(json!({"user": {"name": "A"}})),
        }]);
        a.handle_frame(&Message::awareness(presence).encode()).await;

        let mut b = Connection::new(ConnectionId(2), "doc", MAX);
        let frames = b.attach(&registry).await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(Message::decode(&frames[1]).unwrap(), Message::Awareness(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let registry = DocumentRegistry::new(16);
        let mut a = Connection::new(ConnectionId(1), "doc", MAX);
        let mut b = Connection::new(ConnectionId(2), "doc", MAX);
        a.attach(&registry).await;
        b.attach(&registry).await;

        assert!(a.handle_frame(&[0x07, 0x01]).await.is_none());
        assert!(a.handle_frame(&[0x00, 0x01, 0x09]).await.is_none());
        assert_eq!(a.state(), ConnectionState::Attached);

        let d = delta("still works");
        a.handle_frame(&Message::update(d.clone()).encode()).await;
        let frame = b.next_broadcast().await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::update(d));
    }

    #[tokio::test]
    async fn test_oversized_frame_dropped() {
        let registry = DocumentRegistry::new(16);
        let mut a = Connection::new(ConnectionId(1), "doc", 8);
        a.attach(&registry).await;
        let reply = a.handle_frame(&Message::state_vector(vec![0; 32]).encode()).await;
        assert!(reply.is_none());
        assert_eq!(a.state(), ConnectionState::Attached);
    }

    #[tokio::test]
    async fn test_state_vector_reply() {
        let registry = DocumentRegistry::new(16);
        let mut writer = Connection::new(ConnectionId(1), "doc", MAX);
        writer.attach(&registry).await;
        writer.handle_frame(&Message::update(delta("x")).encode()).await;

        let mut reader = Connection::new(ConnectionId(2), "doc", MAX);
        reader.attach(&registry).await;
        let sv = YrsReplica::new().state_vector();
        let reply = reader.handle_frame(&Message::state_vector(sv).encode()).await.unwrap();
        assert!(matches!(
            Message::decode(&reply).unwrap(),
            Message::Sync(SyncMessage::Update(_))
        ));
    }
}
