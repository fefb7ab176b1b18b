//! Replica store: the opaque merge target behind a document session.
//!
//! The relay never looks inside deltas. It only needs a state-vector
//! summary, a catch-up delta for a peer's state vector, and an
//! idempotent, order-insensitive apply. [`YrsReplica`] provides these on
//! top of a Yrs `Doc`; other engines plug in through [`ReplicaStore`].

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, TransactionMut, Update};

/// v1 encoding of an update carrying no structs and no deletions.
const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// Merge-engine errors. Non-fatal: the offending delta is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("cannot decode replica payload: {0}")]
    Decode(String),
    #[error("cannot apply delta: {0}")]
    Apply(String),
}

/// Contract every merge engine fulfils.
pub trait ReplicaStore: Send {
    /// Compact summary of what this replica has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Delta bringing a peer at `peer_state_vector` up to date.
    ///
    /// Returns `None` when the diff carries nothing: no operations past the
    /// peer's state vector and no deletions. Deletions do not advance a
    /// state vector, so a peer that looks current still receives them.
    fn catch_up_delta(&self, peer_state_vector: &[u8]) -> Result<Option<Vec<u8>>, ReplicaError>;

    /// Merge `delta`. Returns `true` when the logical state changed, which
    /// is when the delta must be forwarded to other peers.
    ///
    /// Applying the same delta twice is a no-op the second time.
    fn apply_delta(&mut self, delta: &[u8]) -> Result<bool, ReplicaError>;

    /// Whether the replica at `peer_state_vector` holds anything this one lacks.
    fn is_behind(&self, peer_state_vector: &[u8]) -> Result<bool, ReplicaError>;
}

/// Factory used by the registry to build a fresh, empty replica per session.
pub type ReplicaFactory = std::sync::Arc<dyn Fn() -> Box<dyn ReplicaStore> + Send + Sync>;

/// Default factory producing [`YrsReplica`] instances.
pub fn yrs_factory() -> ReplicaFactory {
    std::sync::Arc::new(|| Box::new(YrsReplica::new()))
}

/// Replica backed by a Yrs document.
pub struct YrsReplica {
    doc: Doc,
}

impl YrsReplica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Underlying document, for callers that interpret content.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Run a local edit and return the delta it produced.
    pub fn edit<F>(&mut self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let mut txn = self.doc.transact_mut();
        f(&mut txn);
        txn.encode_update_v1()
    }

    /// Current contents of the root text `name`, if it exists.
    pub fn text(&self, name: &str) -> Option<String> {
        let txn = self.doc.transact();
        txn.get_text(name).map(|text| text.get_string(&txn))
    }

    /// Full state as a single update, used to compare replicas.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaStore for YrsReplica {
    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn catch_up_delta(&self, peer_state_vector: &[u8]) -> Result<Option<Vec<u8>>, ReplicaError> {
        let remote = StateVector::decode_v1(peer_state_vector)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        let diff = txn.encode_diff_v1(&remote);
        if diff == EMPTY_UPDATE_V1 {
            Ok(None)
        } else {
            Ok(Some(diff))
        }
    }

    fn apply_delta(&mut self, delta: &[u8]) -> Result<bool, ReplicaError> {
        let update = Update::decode_v1(delta).map_err(|e| ReplicaError::Decode(e.to_string()))?;

        let mut txn = self.doc.transact_mut();
        let before = (txn.snapshot(), pending(&txn));
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        let after = (txn.snapshot(), pending(&txn));

        // A delta whose dependencies are missing is parked as pending. It
        // still has to reach the other peers, who may hold the gap; an exact
        // duplicate leaves the parked set as it was.
        let changed = before != after;
        log::trace!("Applied {} byte delta (changed: {changed})", delta.len());
        Ok(changed)
    }

    fn is_behind(&self, peer_state_vector: &[u8]) -> Result<bool, ReplicaError> {
        let remote = StateVector::decode_v1(peer_state_vector)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let local = self.doc.transact().state_vector();
        Ok(remote.iter().any(|(client, clock)| local.get(client) < *clock))
    }
}

/// Blocks and deletions still waiting for missing dependencies.
fn pending<T: ReadTxn>(txn: &T) -> impl PartialEq {
    let store = txn.store();
    (
        store
            .pending_update()
            .map(|p| (p.missing.clone(), p.update.insertions(true))),
        store.pending_ds().cloned(),
    )
}
