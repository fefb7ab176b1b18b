//! Fan-out broadcast to the N-1 other peers of a session.
//!
//! One tokio broadcast channel per session. Every frame is tagged with the
//! connection that caused it and each peer's [`Subscription`] skips its own
//! frames, so a sender never sees its own echo. Sending never blocks: a
//! peer that falls more than `capacity` frames behind gets
//! [`RecvError::Lagged`] and is disconnected by its connection task.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use docsync_core::ConnectionId;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::RecvError;

/// An encoded frame plus the connection it originated from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: ConnectionId,
    pub payload: Bytes,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_receivers: usize,
}

/// Broadcast group for a single document session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per peer before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a receiver for `conn`.
    pub fn subscribe(&self, conn: ConnectionId) -> Subscription {
        Subscription {
            conn,
            receiver: self.sender.subscribe(),
        }
    }

    /// Send a pre-encoded frame to every subscriber except `origin`.
    ///
    /// Returns the number of receivers the frame was queued for, including
    /// the origin's own (which filters it out on receipt).
    pub fn broadcast(&self, origin: ConnectionId, payload: impl Into<Bytes>) -> usize {
        let envelope = Envelope { origin, payload: payload.into() };
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}

/// Per-connection handle into a session's broadcast stream.
///
/// Returned when a connection attaches; handing it back to
/// [`DocumentSession::detach`](crate::session::DocumentSession::detach)
/// unregisters it.
#[derive(Debug)]
pub struct Subscription {
    conn: ConnectionId,
    receiver: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// Next frame caused by some other connection.
    pub async fn recv(&mut self) -> Result<Bytes, RecvError> {
        loop {
            let envelope = self.receiver.recv().await?;
            if envelope.origin != self.conn {
                return Ok(envelope.payload);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Bytes> {
        while let Ok(envelope) = self.receiver.try_recv() {
            if envelope.origin != self.conn {
                return Some(envelope.payload);
            }
        }
        None
    }
}
