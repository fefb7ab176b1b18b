//! Process-wide map from document name to live session.
//!
//! The registry lock only guards the map. Session contents have their own
//! lock, so traffic on unrelated documents never contends here beyond the
//! lookup.
//!
//! Eviction race: a reaper may find a session empty while a connection that
//! already looked it up is about to attach. [`DocumentRegistry::remove`]
//! re-checks emptiness under the session lock and marks the session
//! evicted; the late attach sees the mark and retries against a fresh
//! session.

use std::collections::HashMap;
use std::sync::Arc;

use docsync_core::{yrs_factory, ConnectionId, ReplicaFactory};
use tokio::sync::RwLock;

use crate::session::{Attachment, DocumentSession};

pub struct DocumentRegistry {
    sessions: RwLock<HashMap<String, Arc<DocumentSession>>>,
    factory: ReplicaFactory,
    /// Per-peer broadcast buffer for new sessions.
    capacity: usize,
}

impl DocumentRegistry {
    /// Registry whose sessions use the Yrs merge engine.
    pub fn new(capacity: usize) -> Self {
        Self::with_factory(capacity, yrs_factory())
    }

    pub fn with_factory(capacity: usize, factory: ReplicaFactory) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            capacity,
        }
    }

    /// Get the session for `name`, creating an empty one if needed.
    pub async fn get_or_create(&self, name: &str) -> Arc<DocumentSession> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(name) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(name) {
            return session.clone();
        }

        let session = Arc::new(DocumentSession::new(name, (self.factory)(), self.capacity));
        sessions.insert(name.to_string(), session.clone());
        log::info!("Created session '{name}' ({} active)", sessions.len());
        session
    }

    /// Attach `conn` to the session for `name`, replacing a session that was
    /// evicted between lookup and attach.
    pub async fn attach(&self, name: &str, conn: ConnectionId) -> (Arc<DocumentSession>, Attachment) {
        loop {
            let session = self.get_or_create(name).await;
            match session.attach(conn).await {
                Ok(attachment) => return (session, attachment),
                Err(_) => {
                    log::debug!("Session '{name}' was evicted during attach of {conn}, retrying");
                }
            }
        }
    }

    /// Remove the session for `name` if it has no peers.
    pub async fn remove(&self, name: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(name) else {
            return false;
        };
        if !session.try_evict().await {
            return false;
        }
        sessions.remove(name);
        true
    }

    /// Remove every session without peers. Returns the reclaimed names.
    pub async fn reap_idle(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for name in self.names().await {
            if self.remove(&name).await {
                reaped.push(name);
            }
        }
        reaped
    }

    pub async fn get(&self, name: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Number of live sessions.
    pub async fn size(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
