//! # docsync-core — Wire format, presence and merge-engine adapters
//!
//! Runtime-free building blocks shared by the relay server and clients.
//!
//! ## Modules
//!
//! - [`encoding`] — lib0-compatible varuint / varbytes primitives
//! - [`protocol`] — SYNC / AWARENESS message envelope
//! - [`awareness`] — per-document presence tracker with per-client clocks
//! - [`replica`] — opaque replica store contract and its Yrs adapter

pub mod encoding;
pub mod protocol;
pub mod awareness;
pub mod replica;

use std::fmt;

pub use protocol::{Message, MessageKind, ProtocolError, SyncKind, SyncMessage};
pub use awareness::{AwarenessChange, AwarenessEntry, AwarenessRecord, AwarenessTracker, ClientId};
pub use replica::{ReplicaError, ReplicaFactory, ReplicaStore, YrsReplica, yrs_factory};

/// Server-assigned handle of one network connection.
///
/// Used as the origin of every change so broadcasts can skip the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
