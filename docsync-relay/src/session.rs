//! Document session: one document's replica, presence and peers.
//!
//! Architecture:
//! ```text
//! Connection A ──┐                         ┌──► Connection B
//!                ├── Mutex<SessionState> ──┤
//! Connection C ──┘   replica + awareness   └──► Connection C
//!                    + peer set
//!                         │
//!                   BroadcastGroup (fan-out, origin skipped)
//! ```
//!
//! Every mutation takes the session lock, applies the change and queues the
//! resulting broadcast before releasing it. The lock is the serialization
//! point: a broadcast for update A is queued ahead of one for a later
//! update B, and peers drain their queues in order.

use std::collections::{BTreeSet, HashMap};

use docsync_core::{
    AwarenessChange, AwarenessTracker, ClientId, ConnectionId, Message, ReplicaStore,
    SyncMessage,
};
use tokio::sync::Mutex;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Subscription};
use crate::error::RelayError;

/// Everything a freshly attached connection needs to send first.
#[derive(Debug)]
pub struct Attachment {
    pub subscription: Subscription,
    /// Encoded SYNC state-vector message (handshake step 1).
    pub sync_step1: Vec<u8>,
    /// Encoded AWARENESS message for every tracked id, if any.
    pub awareness: Option<Vec<u8>>,
}

/// Returned when attaching to a session the registry already evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evicted;

#[derive(Debug, Default)]
struct Peer {
    /// Awareness ids this connection introduced.
    controlled: BTreeSet<ClientId>,
}

struct SessionState {
    replica: Box<dyn ReplicaStore>,
    awareness: AwarenessTracker,
    peers: HashMap<ConnectionId, Peer>,
    evicted: bool,
}

/// Live, in-memory session for one document name.
pub struct DocumentSession {
    name: String,
    state: Mutex<SessionState>,
    broadcast: BroadcastGroup,
}

impl DocumentSession {
    pub fn new(name: impl Into<String>, replica: Box<dyn ReplicaStore>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SessionState {
                replica,
                awareness: AwarenessTracker::new(),
                peers: HashMap::new(),
                evicted: false,
            }),
            broadcast: BroadcastGroup::new(capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `conn` in the peer set and build its handshake frames.
    ///
    /// The subscription is taken under the same lock as the state vector,
    /// so nothing accepted after the snapshot can be missed.
    pub async fn attach(&self, conn: ConnectionId) -> Result<Attachment, Evicted> {
        let mut state = self.state.lock().await;
        if state.evicted {
            return Err(Evicted);
        }

        state.peers.insert(conn, Peer::default());
        let subscription = self.broadcast.subscribe(conn);

        let sync_step1 = Message::state_vector(state.replica.state_vector()).encode();
        let ids = state.awareness.all_client_ids();
        let awareness = if ids.is_empty() {
            None
        } else {
            Some(Message::awareness(state.awareness.encode_changed(&ids)).encode())
        };

        log::debug!(
            "{conn} attached to '{}' ({} peers)",
            self.name,
            state.peers.len()
        );
        Ok(Attachment { subscription, sync_step1, awareness })
    }

    /// Remove the connection owning `subscription` and drop the presence
    /// records it introduced, broadcasting the removal to remaining peers.
    ///
    /// Returns the number of peers left.
    pub async fn detach(&self, subscription: Subscription) -> usize {
        let conn = subscription.connection();
        drop(subscription);

        let mut state = self.state.lock().await;
        let Some(peer) = state.peers.remove(&conn) else {
            return state.peers.len();
        };

        let ids: Vec<ClientId> = peer.controlled.into_iter().collect();
        let change = state.awareness.remove_clients(&ids, conn);
        self.broadcast_awareness(&state.awareness, &change, conn);

        log::debug!(
            "{conn} detached from '{}' ({} peers left)",
            self.name,
            state.peers.len()
        );
        state.peers.len()
    }

    /// Handle a SYNC sub-message from `conn`. Returns a direct reply, if any.
    pub async fn handle_sync(
        &self,
        conn: ConnectionId,
        msg: SyncMessage,
    ) -> Result<Option<Vec<u8>>, RelayError> {
        let mut state = self.state.lock().await;
        match msg {
            SyncMessage::StateVector(sv) => {
                let delta = state.replica.catch_up_delta(&sv)?;
                Ok(delta.map(|d| Message::update(d).encode()))
            }
            SyncMessage::Update(delta) => {
                if state.replica.apply_delta(&delta)? {
                    self.broadcast.broadcast(conn, Message::update(delta).encode());
                }
                Ok(None)
            }
            SyncMessage::Request => {
                Ok(Some(Message::state_vector(state.replica.state_vector()).encode()))
            }
        }
    }

    /// Apply an awareness update from `conn` and relay the changed ids.
    pub async fn handle_awareness(
        &self,
        conn: ConnectionId,
        update: &[u8],
    ) -> Result<AwarenessChange, RelayError> {
        let mut state = self.state.lock().await;
        let change = state.awareness.apply_update(update, conn)?;

        let SessionState { awareness, peers, .. } = &mut *state;
        if let Some(peer) = peers.get_mut(&conn) {
            peer.controlled.extend(&change.added);
            for id in &change.removed {
                peer.controlled.remove(id);
            }
        }
        self.broadcast_awareness(awareness, &change, conn);
        Ok(change)
    }

    fn broadcast_awareness(&self, awareness: &AwarenessTracker, change: &AwarenessChange, origin: ConnectionId) {
        if change.is_empty() {
            return;
        }
        let update = awareness.encode_changed(&change.changed());
        self.broadcast.broadcast(origin, Message::awareness(update).encode());
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn has_peer(&self, conn: ConnectionId) -> bool {
        self.state.lock().await.peers.contains_key(&conn)
    }

    /// Awareness ids currently tracked.
    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.state.lock().await.awareness.all_client_ids()
    }

    /// Current state-vector summary of the replica.
    pub async fn state_vector(&self) -> Vec<u8> {
        self.state.lock().await.replica.state_vector()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    /// Mark evicted if there are no peers. Called by the registry while it
    /// holds its own write lock, so no new lookup can hand this session out.
    pub(crate) async fn try_evict(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.peers.is_empty() {
            state.evicted = true;
        }
        state.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::awareness::{decode_update, encode_update};
    use docsync_core::{AwarenessEntry, YrsReplica};
    use serde_json::json;
    use yrs::{Text, WriteTxn};

    fn session() -> DocumentSession {
        DocumentSession::new("doc-1", Box::new(YrsReplica::new()), 16)
    }

    fn delta(text: &str) -> Vec<u8> {
        YrsReplica::new().edit(|txn| {
            let t = txn.get_or_insert_text("content");
            t.insert(txn, 0, text);
        })
    }

    fn presence(client_id: ClientId, clock: u64, name: &str) -> Vec<u8> {
        encode_update(&[AwarenessEntry {
            client_id,
            clock,
            state: Some(json!({ "user": { "name": name } })),
        }])
    }

    #[tokio::test]
    async fn test_attach_sends_state_vector_only_when_no_presence() {
        let session = session();
        let attachment = session.attach(ConnectionId(1)).await.unwrap();

        let step1 = Message::decode(&attachment.sync_step1).unwrap();
        assert!(matches!(step1, Message::Sync(SyncMessage::StateVector(_))));
        assert!(attachment.awareness.is_none());
        assert_eq!(session.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_delta_broadcast_excludes_origin() {
        let session = session();
        let mut a = session.attach(ConnectionId(1)).await.unwrap().subscription;
        let mut b = session.attach(ConnectionId(2)).await.unwrap().subscription;

        let d = delta("hi");
        let reply = session
            .handle_sync(ConnectionId(1), SyncMessage::Update(d.clone()))
            .await
            .unwrap();
        assert!(reply.is_none());

        let frame = b.recv().await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::update(d));
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_delta_not_rebroadcast() {
        let session = session();
        let _a = session.attach(ConnectionId(1)).await.unwrap();
        let mut b = session.attach(ConnectionId(2)).await.unwrap().subscription;

        let d = delta("once");
        session.handle_sync(ConnectionId(1), SyncMessage::Update(d.clone())).await.unwrap();
        session.handle_sync(ConnectionId(1), SyncMessage::Update(d)).await.unwrap();

        assert!(b.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_gapped_delta_relayed_once() {
        let session = session();
        let _a = session.attach(ConnectionId(1)).await.unwrap();
        let mut b = session.attach(ConnectionId(2)).await.unwrap().subscription;

        let mut writer = YrsReplica::new();
        let first = writer.edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "one");
        });
        let gapped = writer.edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 3, " two");
        });

        for _ in 0..3 {
            session
                .handle_sync(ConnectionId(1), SyncMessage::Update(gapped.clone()))
                .await
                .unwrap();
        }
        assert!(b.try_recv().is_some());
        assert!(b.try_recv().is_none());

        // Filling the gap is still relayed
        session.handle_sync(ConnectionId(1), SyncMessage::Update(first)).await.unwrap();
        assert!(b.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_state_vector_reply_catches_up() {
        let session = session();
        let _a = session.attach(ConnectionId(1)).await.unwrap();
        session
            .handle_sync(ConnectionId(1), SyncMessage::Update(delta("D1")))
            .await
            .unwrap();

        let mut late = YrsReplica::new();
        let reply = session
            .handle_sync(ConnectionId(2), SyncMessage::StateVector(late.state_vector()))
            .await
            .unwrap()
            .expect("catch-up delta");
        let Message::Sync(SyncMessage::Update(catch_up)) = Message::decode(&reply).unwrap() else {
            panic!("expected update");
        };
        late.apply_delta(&catch_up).unwrap();
        assert_eq!(late.text("content").as_deref(), Some("D1"));

        // Already current: nothing to send
        let reply = session
            .handle_sync(ConnectionId(2), SyncMessage::StateVector(late.state_vector()))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_request_returns_state_vector() {
        let session = session();
        let reply = session
            .handle_sync(ConnectionId(1), SyncMessage::Request)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Message::decode(&reply).unwrap(),
            Message::Sync(SyncMessage::StateVector(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_delta_is_error_and_not_broadcast() {
        let session = session();
        let mut b = session.attach(ConnectionId(2)).await.unwrap().subscription;
        let result = session
            .handle_sync(ConnectionId(1), SyncMessage::Update(vec![0xff, 0xff]))
            .await;
        assert!(matches!(result, Err(RelayError::Replica(_))));
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_awareness_relay_and_stale_rejection() {
        let session = session();
        let mut a = session.attach(ConnectionId(1)).await.unwrap().subscription;
        let mut b = session.attach(ConnectionId(2)).await.unwrap().subscription;

        let change = session
            .handle_awareness(ConnectionId(1), &presence(5, 2, "A"))
            .await
            .unwrap();
        assert_eq!(change.added, vec![5]);
        assert!(b.try_recv().is_some());
        assert!(a.try_recv().is_none());

        let change = session
            .handle_awareness(ConnectionId(2), &presence(5, 1, "B"))
            .await
            .unwrap();
        assert!(change.is_empty());
        assert!(a.try_recv().is_none(), "rejected update must not broadcast");
    }

    #[tokio::test]
    async fn test_detach_removes_controlled_ids() {
        let session = session();
        let a = session.attach(ConnectionId(1)).await.unwrap().subscription;
        let mut b = session.attach(ConnectionId(2)).await.unwrap().subscription;

        session.handle_awareness(ConnectionId(1), &presence(7, 0, "X")).await.unwrap();
        session.handle_awareness(ConnectionId(2), &presence(8, 0, "Y")).await.unwrap();
        let _ = b.try_recv();

        let left = session.detach(a).await;
        assert_eq!(left, 1);
        assert_eq!(session.client_ids().await, vec![8]);

        let frame = b.recv().await.unwrap();
        let Message::Awareness(update) = Message::decode(&frame).unwrap() else {
            panic!("expected awareness");
        };
        let entries = decode_update(&update).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].client_id, 7);
        assert!(entries[0].state.is_none());

        // A newcomer's snapshot no longer lists 7
        let attachment = session.attach(ConnectionId(3)).await.unwrap();
        let Message::Awareness(snapshot) = Message::decode(&attachment.awareness.unwrap()).unwrap() else {
            panic!("expected awareness");
        };
        let ids: Vec<ClientId> = decode_update(&snapshot).unwrap().iter().map(|e| e.client_id).collect();
        assert_eq!(ids, vec![8]);
    }

    #[tokio::test]
    async fn test_evicted_session_rejects_attach() {
        let session = session();
        assert!(session.try_evict().await);
        assert_eq!(session.attach(ConnectionId(1)).await.unwrap_err(), Evicted);
    }

    #[tokio::test]
    async fn test_non_empty_session_not_evicted() {
        let session = session();
        let _a = session.attach(ConnectionId(1)).await.unwrap();
        assert!(!session.try_evict().await);
    }
}
