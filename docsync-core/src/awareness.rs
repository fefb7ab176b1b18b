//! Awareness tracking for ephemeral per-client presence.
//!
//! Each client id maps to a JSON state (user name, color, cursor) and a
//! clock. An incoming entry wins only when its clock is strictly greater
//! than the last clock seen for that id, so the whole state is replaced
//! last-writer-wins. Removed ids keep their last clock in `meta` so a
//! late stale update cannot resurrect them.
//!
//! Update wire format:
//! ```text
//! varuint count
//! repeat count:
//!   varuint client_id | varuint clock | varstring json_state ("null" = removed)
//! ```

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::encoding::{BytesReader, BytesWriter};
use crate::protocol::ProtocolError;
use crate::ConnectionId;

/// Awareness key chosen by each client.
pub type ClientId = u64;

/// Presence record for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessRecord {
    /// Arbitrary metadata (name, color, cursor, ...)
    pub state: Value,
    /// Version counter; only ever increases for a given client id
    pub clock: u64,
    /// Connection the record last arrived from
    pub origin: ConnectionId,
}

/// One decoded `(client_id, clock, state)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    /// `None` marks a removal.
    pub state: Option<Value>,
}

/// Ids touched by one tracker call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All ids in `added`, `updated` and `removed` order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Per-document presence map.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    states: BTreeMap<ClientId, AwarenessRecord>,
    /// Last clock per id, including removed ids.
    meta: HashMap<ClientId, u64>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an update and apply every entry that is newer than what we hold.
    pub fn apply_update(
        &mut self,
        update: &[u8],
        origin: ConnectionId,
    ) -> Result<AwarenessChange, ProtocolError> {
        let entries = decode_update(update)?;
        Ok(self.apply_entries(entries, origin))
    }

    /// Apply already decoded entries.
    pub fn apply_entries(
        &mut self,
        entries: impl IntoIterator<Item = AwarenessEntry>,
        origin: ConnectionId,
    ) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for entry in entries {
            let newer = self
                .meta
                .get(&entry.client_id)
                .map_or(true, |&clock| entry.clock > clock);
            if !newer {
                log::trace!(
                    "Ignoring stale awareness for client {} (clock {})",
                    entry.client_id,
                    entry.clock
                );
                continue;
            }
            self.meta.insert(entry.client_id, entry.clock);

            match entry.state {
                Some(state) => {
                    let record = AwarenessRecord { state, clock: entry.clock, origin };
                    if self.states.insert(entry.client_id, record).is_some() {
                        change.updated.push(entry.client_id);
                    } else {
                        change.added.push(entry.client_id);
                    }
                }
                None => {
                    if self.states.remove(&entry.client_id).is_some() {
                        change.removed.push(entry.client_id);
                    }
                }
            }
        }

        change
    }

    /// Set the state of `client_id`, bumping its clock past anything seen.
    ///
    /// Used by the side that owns the id (a client publishing its own presence).
    pub fn set_state(&mut self, client_id: ClientId, state: Value, origin: ConnectionId) -> AwarenessChange {
        let clock = self.meta.get(&client_id).map_or(0, |c| c + 1);
        self.apply_entries([AwarenessEntry { client_id, clock, state: Some(state) }], origin)
    }

    /// Re-publish the current state of `client_id` with a clock that also
    /// beats the removal marker peers hold after this id was disconnected.
    ///
    /// A removal consumes `last + 1`, so the renewed entry takes `last + 2`.
    pub fn renew_state(&mut self, client_id: ClientId, origin: ConnectionId) -> AwarenessChange {
        let Some(record) = self.states.get(&client_id) else {
            return AwarenessChange::default();
        };
        let state = record.state.clone();
        let clock = self.meta.get(&client_id).map_or(0, |c| c + 2);
        self.apply_entries([AwarenessEntry { client_id, clock, state: Some(state) }], origin)
    }

    /// Delete records for `client_ids`.
    ///
    /// The clock of every removed id advances by one so the removal marker
    /// produced by [`encode_changed`](Self::encode_changed) supersedes the
    /// last state peers hold.
    pub fn remove_clients(&mut self, client_ids: &[ClientId], origin: ConnectionId) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for &id in client_ids {
            if self.states.remove(&id).is_some() {
                *self.meta.entry(id).or_insert(0) += 1;
                change.removed.push(id);
            }
        }
        if !change.is_empty() {
            log::debug!("Removed awareness for {:?} (origin {origin})", change.removed);
        }
        change
    }

    /// Drop `client_ids` together with their clocks.
    ///
    /// For a client that lost its relay: the next snapshot must be accepted
    /// whatever clocks it carries.
    pub fn forget_clients(&mut self, client_ids: &[ClientId]) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for id in client_ids {
            self.meta.remove(id);
            if self.states.remove(id).is_some() {
                change.removed.push(*id);
            }
        }
        change
    }

    /// Encode the current state of `client_ids`.
    ///
    /// Ids that are no longer tracked are written as removal markers.
    pub fn encode_changed(&self, client_ids: &[ClientId]) -> Vec<u8> {
        let entries: Vec<AwarenessEntry> = client_ids
            .iter()
            .map(|&id| match self.states.get(&id) {
                Some(record) => AwarenessEntry {
                    client_id: id,
                    clock: record.clock,
                    state: Some(record.state.clone()),
                },
                None => AwarenessEntry {
                    client_id: id,
                    clock: self.meta.get(&id).copied().unwrap_or(0),
                    state: None,
                },
            })
            .collect();
        encode_update(&entries)
    }

    /// Snapshot of currently tracked ids, ascending.
    pub fn all_client_ids(&self) -> Vec<ClientId> {
        self.states.keys().copied().collect()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&AwarenessRecord> {
        self.states.get(&client_id)
    }

    /// Iterate over tracked records.
    pub fn records(&self) -> impl Iterator<Item = (ClientId, &AwarenessRecord)> {
        self.states.iter().map(|(id, record)| (*id, record))
    }

    /// Last clock seen for `client_id`, whether or not it is still present.
    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.meta.get(&client_id).copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Serialize awareness entries.
pub fn encode_update(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut w = BytesWriter::new();
    w.push_var_uint(entries.len() as u64);
    for entry in entries {
        w.push_var_uint(entry.client_id);
        w.push_var_uint(entry.clock);
        match &entry.state {
            Some(state) => w.push_var_string(&state.to_string()),
            None => w.push_var_string("null"),
        }
    }
    w.finish()
}

/// Parse awareness entries. A JSON `null` state decodes to a removal.
pub fn decode_update(bytes: &[u8]) -> Result<Vec<AwarenessEntry>, ProtocolError> {
    let mut r = BytesReader::new(bytes);
    let count = r.read_var_uint()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let client_id = r.read_var_uint()?;
        let clock = r.read_var_uint()?;
        let json = r.read_var_string()?;
        let state: Value =
            serde_json::from_str(json).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        entries.push(AwarenessEntry {
            client_id,
            clock,
            state: if state.is_null() { None } else { Some(state) },
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONN_A: ConnectionId = ConnectionId(1);
    const CONN_B: ConnectionId = ConnectionId(2);

    fn entry(client_id: ClientId, clock: u64, state: Value) -> AwarenessEntry {
        AwarenessEntry { client_id, clock, state: Some(state) }
    }

    #[test]
    fn test_new_client_added() {
        let mut tracker = AwarenessTracker::new();
        let change = tracker.apply_entries([entry(5, 0, json!({"name": "A"}))], CONN_A);
        assert_eq!(change.added, vec![5]);
        assert!(change.updated.is_empty());
        assert_eq!(tracker.get(5).unwrap().origin, CONN_A);
    }

    #[test]
    fn test_lower_clock_rejected() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(5, 2, json!({"name": "A"}))], CONN_A);
        let change = tracker.apply_entries([entry(5, 1, json!({"name": "B"}))], CONN_B);

        assert!(change.is_empty());
        assert_eq!(tracker.get(5).unwrap().state, json!({"name": "A"}));
    }

    #[test]
    fn test_equal_clock_rejected() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(5, 2, json!({"name": "A"}))], CONN_A);
        let change = tracker.apply_entries([entry(5, 2, json!({"name": "B"}))], CONN_A);
        assert!(change.is_empty());
        assert_eq!(tracker.get(5).unwrap().state, json!({"name": "A"}));
    }

    #[test]
    fn test_newer_clock_replaces_whole_state() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(5, 1, json!({"name": "A", "cursor": 3}))], CONN_A);
        let change = tracker.apply_entries([entry(5, 2, json!({"name": "A2"}))], CONN_A);

        assert_eq!(change.updated, vec![5]);
        assert_eq!(tracker.get(5).unwrap().state, json!({"name": "A2"}));
        assert_eq!(tracker.get(5).unwrap().clock, 2);
    }

    #[test]
    fn test_remove_clients_marks_removed() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(7, 3, json!({})), entry(8, 0, json!({}))], CONN_A);

        let change = tracker.remove_clients(&[7, 99], CONN_A);
        assert_eq!(change.removed, vec![7]);
        assert!(tracker.get(7).is_none());
        assert_eq!(tracker.clock(7), Some(4));
        assert_eq!(tracker.all_client_ids(), vec![8]);
    }

    #[test]
    fn test_removed_id_rejects_stale_state() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(7, 3, json!({"name": "A"}))], CONN_A);
        tracker.remove_clients(&[7], CONN_A);

        // Clock 4 was consumed by the removal
        let change = tracker.apply_entries([entry(7, 4, json!({"name": "late"}))], CONN_A);
        assert!(change.is_empty());
        assert!(tracker.get(7).is_none());

        let change = tracker.apply_entries([entry(7, 5, json!({"name": "back"}))], CONN_A);
        assert_eq!(change.added, vec![7]);
    }

    #[test]
    fn test_remote_null_removes() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(3, 0, json!({}))], CONN_A);
        let removal = AwarenessEntry { client_id: 3, clock: 1, state: None };
        let change = tracker.apply_entries([removal], CONN_A);
        assert_eq!(change.removed, vec![3]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_null_for_unknown_id_is_not_a_change() {
        let mut tracker = AwarenessTracker::new();
        let removal = AwarenessEntry { client_id: 3, clock: 1, state: None };
        assert!(tracker.apply_entries([removal], CONN_A).is_empty());
        assert_eq!(tracker.clock(3), Some(1));
    }

    #[test]
    fn test_encode_changed_includes_removal_marker() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(1, 0, json!({"name": "A"})), entry(2, 4, json!({}))], CONN_A);
        tracker.remove_clients(&[2], CONN_A);

        let bytes = tracker.encode_changed(&[1, 2]);
        let entries = decode_update(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], entry(1, 0, json!({"name": "A"})));
        assert_eq!(entries[1], AwarenessEntry { client_id: 2, clock: 5, state: None });
    }

    #[test]
    fn test_encoded_removal_applies_on_peer() {
        let mut server = AwarenessTracker::new();
        let mut peer = AwarenessTracker::new();
        let join = encode_update(&[entry(7, 0, json!({"name": "X"}))]);
        server.apply_update(&join, CONN_A).unwrap();
        peer.apply_update(&join, CONN_B).unwrap();

        server.remove_clients(&[7], CONN_A);
        let change = peer.apply_update(&server.encode_changed(&[7]), CONN_B).unwrap();
        assert_eq!(change.removed, vec![7]);
        assert!(peer.is_empty());
    }

    #[test]
    fn test_set_state_bumps_clock() {
        let mut tracker = AwarenessTracker::new();
        tracker.set_state(42, json!({"user": {"name": "A"}}), CONN_A);
        tracker.set_state(42, json!({"user": {"name": "B"}}), CONN_A);
        assert_eq!(tracker.get(42).unwrap().clock, 1);
        assert_eq!(tracker.get(42).unwrap().state["user"]["name"], "B");
    }

    #[test]
    fn test_renewed_state_beats_removal_marker() {
        let mut own = AwarenessTracker::new();
        own.set_state(11, json!({"user": {"name": "Bob"}}), CONN_A);

        // Peer saw clock 0, then the relay's removal at clock 1
        let mut peer = AwarenessTracker::new();
        peer.apply_update(&own.encode_changed(&[11]), CONN_B).unwrap();
        peer.apply_entries([AwarenessEntry { client_id: 11, clock: 1, state: None }], CONN_B);
        assert!(peer.is_empty());

        // Re-sending the old entry is stale
        assert!(peer.apply_update(&own.encode_changed(&[11]), CONN_B).unwrap().is_empty());

        let change = own.renew_state(11, CONN_A);
        assert_eq!(change.updated, vec![11]);
        assert_eq!(own.get(11).unwrap().clock, 2);

        let change = peer.apply_update(&own.encode_changed(&[11]), CONN_B).unwrap();
        assert_eq!(change.added, vec![11]);
        assert_eq!(peer.get(11).unwrap().state["user"]["name"], "Bob");
    }

    #[test]
    fn test_forgotten_client_accepts_any_clock() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(10, 3, json!({"name": "A"}))], CONN_A);

        let change = tracker.forget_clients(&[10, 99]);
        assert_eq!(change.removed, vec![10]);
        assert_eq!(tracker.clock(10), None);

        let change = tracker.apply_entries([entry(10, 3, json!({"name": "A"}))], CONN_A);
        assert_eq!(change.added, vec![10]);
    }

    #[test]
    fn test_renew_unknown_id_is_noop() {
        let mut tracker = AwarenessTracker::new();
        assert!(tracker.renew_state(4, CONN_A).is_empty());
        assert_eq!(tracker.clock(4), None);
    }

    #[test]
    fn test_change_order() {
        let change = AwarenessChange { added: vec![1], updated: vec![2], removed: vec![3] };
        assert_eq!(change.changed(), vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_invalid_json() {
        let mut w = BytesWriter::new();
        w.push_var_uint(1);
        w.push_var_uint(1);
        w.push_var_uint(0);
        w.push_var_string("{not json");
        assert!(matches!(
            decode_update(&w.finish()),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        // count = 2, only one partial entry
        assert!(decode_update(&[2, 1]).is_err());
    }

    #[test]
    fn test_all_client_ids_sorted() {
        let mut tracker = AwarenessTracker::new();
        tracker.apply_entries([entry(9, 0, json!({})), entry(2, 0, json!({}))], CONN_A);
        assert_eq!(tracker.all_client_ids(), vec![2, 9]);
        assert_eq!(tracker.len(), 2);
    }
}
