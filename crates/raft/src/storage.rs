//! In-memory log storage for the consensus engine.
//!
//! `MemStorage` implements the `raft::Storage` trait over lock-protected
//! state, plus the mutators the ready loop needs (append, hard/conf state,
//! snapshot installation, compaction). The log tail lives in memory; snapshots
//! bound its growth and are what persistence (when enabled) writes to disk.
//!
//! # Thread Safety
//!
//! The core is wrapped in `Arc<RwLock<..>>` so the same storage can be handed
//! to `RawNode` and kept by the node loop. Multiple readers can access the
//! state simultaneously; writers have exclusive access.

use maat_common::NodeId;
use prost::Message as _;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::RaftState;
use raft::{GetEntriesContext, StorageError};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct StorageCore {
    /// Persistent voting state (term, vote, commit).
    hard_state: HardState,
    /// Current cluster membership configuration.
    conf_state: ConfState,
    /// Log entries after the latest compaction point.
    entries: Vec<Entry>,
    /// Index/term the log was last compacted at.
    compacted_index: u64,
    compacted_term: u64,
    /// Latest full snapshot, served to lagging followers.
    snapshot: Option<Snapshot>,
}

impl StorageCore {
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(entry) => entry.index,
            None => self.compacted_index + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.index,
            None => self.compacted_index,
        }
    }
}

/// In-memory Raft log storage.
///
/// Clones share the same underlying state: one clone goes into `RawNode`,
/// another stays with the node loop for persistence and compaction.
#[derive(Clone, Default)]
pub struct MemStorage {
    core: Arc<RwLock<StorageCore>>,
}

impl MemStorage {
    /// Creates empty storage with no configured voters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage with an initial voter set (cluster bootstrap).
    pub fn with_voters(voters: Vec<NodeId>) -> Self {
        let storage = Self::new();
        {
            let mut core = storage.wl();
            core.conf_state = ConfState {
                voters,
                ..Default::default()
            };
        }
        storage
    }

    fn rl(&self) -> RwLockReadGuard<'_, StorageCore> {
        self.core.read().expect("storage lock poisoned")
    }

    fn wl(&self) -> RwLockWriteGuard<'_, StorageCore> {
        self.core.write().expect("storage lock poisoned")
    }

    /// Current hard state.
    pub fn hard_state(&self) -> HardState {
        self.rl().hard_state.clone()
    }

    /// Replaces the hard state (ready-loop persistence step).
    pub fn set_hard_state(&self, hard_state: HardState) {
        self.wl().hard_state = hard_state;
    }

    /// Current membership configuration.
    pub fn conf_state(&self) -> ConfState {
        self.rl().conf_state.clone()
    }

    /// Replaces the membership configuration (after an applied conf change).
    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.wl().conf_state = conf_state;
    }

    /// Index the log was last compacted at (0 before any compaction).
    pub fn compacted_index(&self) -> u64 {
        self.rl().compacted_index
    }

    /// Appends entries, truncating any conflicting suffix first.
    ///
    /// Entries must attach to the existing log: the batch may overlap the
    /// tail (conflict truncation) but may not leave a gap or reach back past
    /// the compaction point.
    pub fn append(&self, entries: &[Entry]) -> raft::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut core = self.wl();
        let first_new = entries[0].index;

        if first_new <= core.compacted_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if first_new > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        // Drop everything the new batch overwrites, then extend
        let keep = (first_new - core.first_index()) as usize;
        core.entries.truncate(keep);
        core.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Records a freshly created snapshot so lagging followers can be served.
    pub fn install_snapshot(&self, snapshot: Snapshot) -> raft::Result<()> {
        let mut core = self.wl();
        let index = snapshot.get_metadata().index;
        if index < core.compacted_index {
            return Err(raft::Error::Store(StorageError::SnapshotOutOfDate));
        }
        core.snapshot = Some(snapshot);
        Ok(())
    }

    /// Applies a snapshot received from the leader (or recovered from disk):
    /// resets the log to start after the snapshot point and adopts its
    /// membership and commit state.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> raft::Result<()> {
        let mut core = self.wl();
        let metadata = snapshot.get_metadata();

        if metadata.index <= core.compacted_index {
            return Err(raft::Error::Store(StorageError::SnapshotOutOfDate));
        }

        core.compacted_index = metadata.index;
        core.compacted_term = metadata.term;
        core.hard_state.commit = metadata.index;
        if metadata.term > core.hard_state.term {
            core.hard_state.term = metadata.term;
        }
        if let Some(conf_state) = &metadata.conf_state {
            core.conf_state = conf_state.clone();
        }
        core.entries.clear();
        core.snapshot = Some(snapshot);
        Ok(())
    }

    /// Discards log entries up to and including `index`.
    ///
    /// The caller must not compact beyond the applied index.
    pub fn compact(&self, index: u64) -> raft::Result<()> {
        let mut core = self.wl();

        if index <= core.compacted_index {
            return Ok(());
        }
        if index > core.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let term = core
            .entries
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.term)
            .ok_or(raft::Error::Store(StorageError::Unavailable))?;

        let first = core.first_index();
        core.entries.drain(..=(index - first) as usize);
        core.compacted_index = index;
        core.compacted_term = term;
        Ok(())
    }
}

impl raft::Storage for MemStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.rl();
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.rl();

        if low <= core.compacted_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let first = core.first_index();
        let lo = (low - first) as usize;
        let hi = (high - first) as usize;
        let mut selected: Vec<Entry> = core.entries[lo..hi].to_vec();

        // Bound the batch by encoded size, always keeping at least one entry
        if let Some(max_size) = max_size.into() {
            let mut total = 0u64;
            let mut keep = 0usize;
            for entry in &selected {
                total += entry.encoded_len() as u64;
                if keep > 0 && total > max_size {
                    break;
                }
                keep += 1;
            }
            selected.truncate(keep);
        }

        Ok(selected)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.rl();

        if idx == core.compacted_index {
            return Ok(core.compacted_term);
        }
        if idx < core.compacted_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > core.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let first = core.first_index();
        Ok(core.entries[(idx - first) as usize].term)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.rl();
        match &core.snapshot {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => {
                Ok(snapshot.clone())
            }
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}
