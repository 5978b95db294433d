//! Replicated state machine for the consensus engine.
//!
//! The state machine maintains the key/value map and tracks the last applied
//! log index. The map lives behind a read/write lock: the apply path is the
//! single writer, while arbitrarily many readers serve `get` calls through
//! cheap [`StateReader`] handles.
//!
//! Application must be deterministic: the map is a `BTreeMap` so that
//! serializing a snapshot of the same logical state produces identical bytes
//! on every node.

use maat_common::{Error, LogIndex, NodeId, Result, Term};
use maat_protocol::{Command, CommandError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Serialized form of a state machine snapshot.
///
/// Includes the voter address book so a node restored from this snapshot can
/// reach its peers again without replaying membership entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Raft log index this snapshot covers (entries up to and including it).
    pub last_applied: LogIndex,
    /// Term of the entry at `last_applied`.
    pub term: Term,
    /// The full key/value map at `last_applied`.
    pub entries: BTreeMap<String, String>,
    /// Voter addresses known at `last_applied`.
    pub members: HashMap<NodeId, String>,
}

impl SnapshotData {
    /// Serialize to bytes for a Raft snapshot or the on-disk snapshot file.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from Raft snapshot or on-disk bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Cheap cloneable read handle onto the state machine's map.
///
/// Handed to the store façade so reads never go through the consensus engine.
#[derive(Clone)]
pub struct StateReader {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl StateReader {
    /// Look up the current value for a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().ok()?.get(key).cloned()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().map(|m| m.len()).unwrap_or(0)
    }

    /// True when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State machine that applies committed log commands to the key/value map.
pub struct StateMachine {
    /// The key/value data, shared with `StateReader` handles.
    data: Arc<RwLock<BTreeMap<String, String>>>,
    /// The last applied log index.
    last_applied: LogIndex,
}

impl StateMachine {
    /// Creates a new empty state machine.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            last_applied: 0,
        }
    }

    /// Returns a read handle sharing this machine's map.
    pub fn reader(&self) -> StateReader {
        StateReader {
            data: Arc::clone(&self.data),
        }
    }

    /// Returns the last applied log index (0 before any entry is applied).
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Apply a committed log entry's command bytes at `index`.
    ///
    /// Entries must arrive in ascending index order; gaps are legal (membership
    /// entries are applied elsewhere) but going backwards is not. `Set`
    /// overwrites unconditionally; `Delete` of an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Storage`] if `index` is not beyond `last_applied`
    /// - [`Error::ApplyDecode`] if the bytes do not decode to a state machine
    ///   command — fatal to the node, which must stop applying rather than
    ///   diverge from its peers
    pub fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<Vec<u8>> {
        if index <= self.last_applied {
            return Err(Error::Storage(format!(
                "entry {index} already applied (last applied {})",
                self.last_applied
            )));
        }

        let command = Command::decode(data).map_err(|e| Error::ApplyDecode(e.to_string()))?;

        let mut map = self
            .data
            .write()
            .map_err(|_| Error::Storage("state machine lock poisoned".to_string()))?;
        let output = command.apply(&mut map).map_err(|e| match e {
            CommandError::NotStateMachineCommand => {
                Error::ApplyDecode("membership command routed to the state machine".to_string())
            }
            other => Error::Serialization(other.to_string()),
        })?;
        drop(map);

        self.last_applied = index;
        Ok(output)
    }

    /// Capture a consistent point-in-time snapshot of the map.
    ///
    /// The map is copied under the read lock and serialized outside it, so
    /// concurrent readers proceed and the apply path is blocked only for the
    /// copy, never for serialization or I/O. The consensus engine fills in
    /// `term` (and may advance `last_applied` past the last state machine
    /// command) before the snapshot is installed or persisted.
    pub fn snapshot(&self, members: HashMap<NodeId, String>) -> Result<SnapshotData> {
        let entries = self
            .data
            .read()
            .map_err(|_| Error::Storage("state machine lock poisoned".to_string()))?
            .clone();

        Ok(SnapshotData {
            last_applied: self.last_applied,
            term: 0,
            entries,
            members,
        })
    }

    /// Replace the entire map with a snapshot's contents.
    ///
    /// Only invoked before the node resumes applying entries, never
    /// concurrently with `apply`.
    pub fn restore(&mut self, snapshot: &SnapshotData) -> Result<()> {
        let mut map = self
            .data
            .write()
            .map_err(|_| Error::Storage("state machine lock poisoned".to_string()))?;
        *map = snapshot.entries.clone();
        drop(map);

        self.last_applied = snapshot.last_applied;
        Ok(())
    }

    /// Forces the last applied index forward without touching the map.
    ///
    /// Used when a snapshot installed by the consensus engine covers indexes
    /// beyond the last state machine command (e.g. membership entries).
    pub fn advance_applied(&mut self, index: LogIndex) {
        if index > self.last_applied {
            self.last_applied = index;
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Vec<u8> {
        Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
        .encode()
        .expect("encode should succeed")
    }

    fn delete(key: &str) -> Vec<u8> {
        Command::Delete {
            key: key.to_string(),
        }
        .encode()
        .expect("encode should succeed")
    }

    #[test]
    fn test_new_starts_empty() {
        let sm = StateMachine::new();
        assert_eq!(sm.last_applied(), 0);
        assert!(sm.reader().is_empty());
    }

    #[test]
    fn test_apply_set_and_read() {
        let mut sm = StateMachine::new();
        let reader = sm.reader();

        let result = sm.apply(1, &set("region", "us-east-1")).unwrap();
        assert_eq!(result, b"OK");
        assert_eq!(sm.last_applied(), 1);
        assert_eq!(reader.get("region"), Some("us-east-1".to_string()));
    }

    #[test]
    fn test_apply_delete_existing_and_absent() {
        let mut sm = StateMachine::new();
        sm.apply(1, &set("k", "v")).unwrap();

        assert_eq!(sm.apply(2, &delete("k")).unwrap(), b"1");
        assert_eq!(sm.reader().get("k"), None);

        // Absent key: no-op, not an error
        assert_eq!(sm.apply(3, &delete("k")).unwrap(), b"0");
        assert_eq!(sm.last_applied(), 3);
    }

    #[test]
    fn test_apply_rejects_stale_index() {
        let mut sm = StateMachine::new();
        sm.apply(5, &set("k", "v")).unwrap();

        let result = sm.apply(5, &set("k", "v2"));
        assert!(result.is_err());
        let result = sm.apply(3, &set("k", "v2"));
        assert!(result.is_err());

        // The failed applies did not touch the map
        assert_eq!(sm.reader().get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_apply_allows_index_gaps() {
        // Membership entries consume indexes without reaching the state
        // machine, so gaps are legal
        let mut sm = StateMachine::new();
        sm.apply(1, &set("a", "1")).unwrap();
        sm.apply(4, &set("b", "2")).unwrap();
        assert_eq!(sm.last_applied(), 4);
    }

    #[test]
    fn test_apply_garbage_is_decode_error() {
        let mut sm = StateMachine::new();
        let result = sm.apply(1, &[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result.unwrap_err(), Error::ApplyDecode(_)));
        // Nothing applied
        assert_eq!(sm.last_applied(), 0);
    }

    #[test]
    fn test_apply_membership_command_is_decode_error() {
        let mut sm = StateMachine::new();
        let bytes = Command::AddVoter {
            node_id: 2,
            addr: "10.0.0.2:8786".to_string(),
        }
        .encode()
        .unwrap();

        let result = sm.apply(1, &bytes);
        assert!(matches!(result.unwrap_err(), Error::ApplyDecode(_)));
    }

    #[test]
    fn test_determinism_across_nodes() {
        // The same ordered entry sequence produces byte-identical snapshots
        // regardless of which node applies it
        let script: Vec<(u64, Vec<u8>)> = vec![
            (1, set("a", "1")),
            (2, set("b", "2")),
            (3, delete("a")),
            (4, set("c", "3")),
            (5, set("b", "override")),
        ];

        let mut first = StateMachine::new();
        let mut second = StateMachine::new();
        for (index, data) in &script {
            first.apply(*index, data).unwrap();
            second.apply(*index, data).unwrap();
        }

        let snap_a = first.snapshot(HashMap::new()).unwrap().encode().unwrap();
        let snap_b = second.snapshot(HashMap::new()).unwrap().encode().unwrap();
        assert_eq!(snap_a, snap_b);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut sm = StateMachine::new();
        sm.apply(1, &set("a", "1")).unwrap();
        sm.apply(2, &set("b", "2")).unwrap();

        let mut members = HashMap::new();
        members.insert(1u64, "127.0.0.1:8786".to_string());
        let snapshot = sm.snapshot(members.clone()).unwrap();

        let mut restored = StateMachine::new();
        restored.restore(&snapshot).unwrap();

        assert_eq!(restored.last_applied(), 2);
        assert_eq!(restored.reader().get("a"), Some("1".to_string()));
        assert_eq!(restored.reader().get("b"), Some("2".to_string()));
        assert_eq!(snapshot.members, members);
    }

    #[test]
    fn test_restore_replaces_existing_state() {
        let mut sm = StateMachine::new();
        sm.apply(1, &set("old", "gone")).unwrap();

        let mut other = StateMachine::new();
        other.apply(1, &set("new", "kept")).unwrap();
        other.apply(2, &set("also", "kept")).unwrap();
        let snapshot = other.snapshot(HashMap::new()).unwrap();

        sm.restore(&snapshot).unwrap();
        assert_eq!(sm.reader().get("old"), None);
        assert_eq!(sm.reader().get("new"), Some("kept".to_string()));
        assert_eq!(sm.last_applied(), 2);
    }

    #[test]
    fn test_snapshot_then_restore_immediately_is_identity() {
        let mut sm = StateMachine::new();
        sm.apply(1, &set("x", "y")).unwrap();

        let before = sm.snapshot(HashMap::new()).unwrap();
        sm.restore(&before).unwrap();
        let after = sm.snapshot(HashMap::new()).unwrap();

        assert_eq!(before.encode().unwrap(), after.encode().unwrap());
    }

    #[test]
    fn test_snapshot_data_codec_round_trip() {
        let mut entries = BTreeMap::new();
        entries.insert("k".to_string(), "v".to_string());
        let data = SnapshotData {
            last_applied: 9,
            term: 2,
            entries,
            members: HashMap::new(),
        };

        let bytes = data.encode().unwrap();
        let decoded = SnapshotData::decode(&bytes).unwrap();
        assert_eq!(decoded.last_applied, 9);
        assert_eq!(decoded.entries.get("k"), Some(&"v".to_string()));
    }

    #[test]
    fn test_advance_applied_only_moves_forward() {
        let mut sm = StateMachine::new();
        sm.advance_applied(5);
        assert_eq!(sm.last_applied(), 5);
        sm.advance_applied(3);
        assert_eq!(sm.last_applied(), 5);
    }

    #[test]
    fn test_reader_survives_state_machine_scope() {
        let reader = {
            let mut sm = StateMachine::new();
            sm.apply(1, &set("k", "v")).unwrap();
            sm.reader()
        };
        assert_eq!(reader.get("k"), Some("v".to_string()));
    }
}
