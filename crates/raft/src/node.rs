//! Raft node implementation that wraps raft-rs RawNode.
//!
//! The RaftNode integrates MemStorage, StateMachine, and the secure transport
//! into a complete consensus engine. One run loop owns the logical clock and
//! the inbound message stream, so entries are applied by exactly one
//! execution context, in index order, with no gaps or reordering.
//!
//! Proposals are tracked by an ID carried in the entry context; when the
//! entry commits and applies, the proposer's oneshot resolves with the
//! applied index. An entry that never commits (lost leadership, partition)
//! simply never resolves, which the store surfaces as a commit timeout.

use crate::config::{NodeConfig, RaftConfig};
use crate::state_machine::{SnapshotData, StateMachine, StateReader};
use crate::storage::MemStorage;
use crate::transport::RaftTransport;
use maat_common::{Error, LogIndex, NodeId, Result};
use maat_protocol::Command;
use prost::Message as _;
use raft::eraftpb::{
    ConfChange, ConfChangeType, Entry, EntryType, Message as RaftMessage, Snapshot,
    SnapshotMetadata,
};
use raft::{RawNode, Storage as _};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Consensus engine for one Maat node.
///
/// Owns the raft-rs `RawNode`, the log storage, the state machine, and the
/// secure transport. The store façade drives it through `propose`,
/// `propose_add_voter`, and the leadership queries; the [`RaftNode::run`]
/// loop drives everything else.
pub struct RaftNode {
    /// Node identifier.
    id: NodeId,
    /// raft-rs RawNode instance.
    raw: Mutex<RawNode<MemStorage>>,
    /// Log storage, shared with the RawNode.
    storage: MemStorage,
    /// State machine for applying committed entries.
    fsm: Mutex<StateMachine>,
    /// Read handle onto the state machine's map.
    reader: StateReader,
    /// Secure transport carrying consensus traffic.
    transport: Arc<RaftTransport>,
    /// Pending proposals indexed by proposal ID.
    pending: Mutex<HashMap<u64, oneshot::Sender<LogIndex>>>,
    /// Next proposal ID.
    next_proposal_id: AtomicU64,
    /// Current leader ID (valid when `has_leader`).
    leader_id: AtomicU64,
    /// Whether a leader is currently known.
    has_leader: AtomicBool,
    /// Highest applied log index, including membership and empty entries.
    applied: AtomicU64,
    /// Voter address book.
    members: RwLock<HashMap<NodeId, String>>,
    /// Timing and snapshot policy.
    config: RaftConfig,
    /// Snapshot file location, None when running in-memory only.
    snapshot_path: Option<PathBuf>,
}

impl RaftNode {
    /// Creates the consensus engine for a node.
    ///
    /// Recovers from an existing on-disk snapshot when one is present (the
    /// snapshot's membership then takes precedence over `bootstrap`).
    /// Otherwise a bootstrapped node starts as the sole voter of a brand-new
    /// cluster, and a non-bootstrapped node starts with no configuration,
    /// waiting to be admitted by a leader.
    pub fn new(
        node_config: &NodeConfig,
        raft_config: RaftConfig,
        transport: Arc<RaftTransport>,
        bootstrap: bool,
    ) -> Result<Arc<Self>> {
        let advertise = transport.local_addr().to_string();
        let snapshot_path = node_config.snapshot_path();

        let storage = MemStorage::new();
        let mut fsm = StateMachine::new();
        let mut members: HashMap<NodeId, String> = HashMap::new();
        let mut applied = 0;

        let recovered = match &snapshot_path {
            Some(path) if path.exists() => {
                let data = SnapshotData::decode(&std::fs::read(path)?)?;
                info!(
                    path = %path.display(),
                    index = data.last_applied,
                    "recovering from snapshot"
                );
                storage
                    .apply_snapshot(raft_snapshot(&data)?)
                    .map_err(|e| Error::Storage(e.to_string()))?;
                fsm.restore(&data)?;
                applied = data.last_applied;
                members = data.members.clone();
                true
            }
            _ => false,
        };

        if !recovered && bootstrap {
            // Brand-new single-node cluster: this node is the sole voter
            storage.set_conf_state(raft::eraftpb::ConfState {
                voters: vec![node_config.id],
                ..Default::default()
            });
            members.insert(node_config.id, advertise.clone());
        }
        members.entry(node_config.id).or_insert(advertise);

        for (id, addr) in &members {
            if *id != node_config.id {
                transport.add_peer(*id, addr.clone());
            }
        }

        let config = raft::Config {
            id: node_config.id,
            election_tick: raft_config.election_tick,
            heartbeat_tick: raft_config.heartbeat_tick,
            applied,
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| Error::Config(format!("raft config: {e}")))?;

        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let raw = RawNode::new(&config, storage.clone(), &logger)
            .map_err(|e| Error::Raft(e.to_string()))?;

        let reader = fsm.reader();
        Ok(Arc::new(Self {
            id: node_config.id,
            raw: Mutex::new(raw),
            storage,
            fsm: Mutex::new(fsm),
            reader,
            transport,
            pending: Mutex::new(HashMap::new()),
            next_proposal_id: AtomicU64::new(1),
            leader_id: AtomicU64::new(0),
            has_leader: AtomicBool::new(false),
            applied: AtomicU64::new(applied),
            members: RwLock::new(members),
            config: raft_config,
            snapshot_path,
        }))
    }

    /// This node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Read handle onto the state machine's map.
    pub fn reader(&self) -> StateReader {
        self.reader.clone()
    }

    /// Checks if this node is currently the cluster leader.
    pub fn is_leader(&self) -> bool {
        self.leader_id() == Some(self.id)
    }

    /// Returns the current leader's node ID, if known.
    ///
    /// Unknown during elections and partitions; callers use it as the
    /// redirect hint in `NotLeader` errors.
    pub fn leader_id(&self) -> Option<NodeId> {
        if self.has_leader.load(Ordering::Acquire) {
            Some(self.leader_id.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Highest applied log index.
    pub fn applied_index(&self) -> LogIndex {
        self.applied.load(Ordering::Acquire)
    }

    /// Current voter address book, this node included.
    pub fn membership(&self) -> HashMap<NodeId, String> {
        self.members.read().expect("membership lock poisoned").clone()
    }

    /// True when `id` is in the current voting configuration.
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.storage.conf_state().voters.contains(&id)
    }

    /// Advertise address recorded for a member.
    pub fn member_addr(&self, id: NodeId) -> Option<String> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Re-registers a member's advertise address without a membership change.
    pub fn update_member_addr(&self, id: NodeId, addr: String) {
        self.members
            .write()
            .expect("membership lock poisoned")
            .insert(id, addr.clone());
        self.transport.add_peer(id, addr);
    }

    /// Starts an election immediately (single-node bootstrap).
    pub fn campaign(&self) -> Result<()> {
        self.raw_lock()
            .campaign()
            .map_err(|e| Error::Raft(e.to_string()))
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&self) {
        self.raw_lock().tick();
    }

    /// Feeds a message from a peer into the raft state machine.
    pub fn step(&self, message: RaftMessage) -> Result<()> {
        self.raw_lock()
            .step(message)
            .map_err(|e| Error::Raft(e.to_string()))
    }

    /// Proposes a command, returning a receiver that resolves with the
    /// applied log index once the entry commits.
    ///
    /// The receiver never resolving means the entry was lost to a leadership
    /// change; callers bound the wait and report a commit timeout.
    pub fn propose(&self, command: &Command) -> Result<oneshot::Receiver<LogIndex>> {
        let data = command
            .encode()
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let (proposal_id, rx) = self.register_proposal();
        let result = self
            .raw_lock()
            .propose(proposal_id.to_be_bytes().to_vec(), data);

        if let Err(e) = result {
            self.abandon_proposal(proposal_id);
            return Err(self.map_propose_error(e));
        }
        Ok(rx)
    }

    /// Proposes admitting `node_id` at `addr` as a voter.
    ///
    /// The address rides in the configuration-change context so every node
    /// learns it when the change commits.
    pub fn propose_add_voter(
        &self,
        node_id: NodeId,
        addr: &str,
    ) -> Result<oneshot::Receiver<LogIndex>> {
        let context = Command::AddVoter {
            node_id,
            addr: addr.to_string(),
        }
        .encode()
        .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = node_id;
        change.context = context.into();

        let (proposal_id, rx) = self.register_proposal();
        let result = self
            .raw_lock()
            .propose_conf_change(proposal_id.to_be_bytes().to_vec(), change);

        if let Err(e) = result {
            self.abandon_proposal(proposal_id);
            return Err(self.map_propose_error(e));
        }
        Ok(rx)
    }

    /// Runs the consensus loop: logical clock ticks, inbound messages, and
    /// ready-state processing, until shutdown or a fatal apply error.
    ///
    /// A fatal error (a committed entry that does not decode) stops the loop:
    /// the node stops participating rather than diverge from its peers.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<RaftMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                message = inbound.recv() => match message {
                    Some(message) => {
                        if let Err(error) = self.step(message) {
                            warn!(%error, "failed to step raft message");
                        }
                    }
                    None => {
                        debug!("transport channel closed; consensus loop exiting");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("consensus loop shutting down");
                    break;
                }
            }

            if let Err(error) = self.process_ready() {
                error!(%error, "fatal error processing ready state; node stops participating");
                break;
            }
        }
    }

    /// Processes the pending ready state, in the order raft-rs requires:
    /// install snapshot, persist entries and hard state, send messages, apply
    /// committed entries, advance.
    pub fn process_ready(&self) -> Result<()> {
        let mut ready = {
            let mut raw = self.raw_lock();
            self.update_leader(raw.raft.leader_id);
            if !raw.has_ready() {
                return Ok(());
            }
            raw.ready()
        };

        if !ready.snapshot().is_empty() {
            self.install_received_snapshot(ready.snapshot().clone())?;
        }

        let entries = ready.take_entries();
        if !entries.is_empty() {
            self.storage
                .append(&entries)
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state.clone());
        }

        // Safe to send only now that entries and hard state are persisted
        self.transport.send(ready.take_messages());
        self.transport.send(ready.take_persisted_messages());

        self.apply_entries(ready.take_committed_entries())?;

        let mut light = {
            let mut raw = self.raw_lock();
            raw.advance(ready)
        };
        self.transport.send(light.take_messages());
        self.apply_entries(light.take_committed_entries())?;
        {
            let mut raw = self.raw_lock();
            raw.advance_apply();
            self.update_leader(raw.raft.leader_id);
        }

        self.maybe_snapshot()
    }

    /// Writes a final snapshot to disk (no-op when running in-memory).
    pub fn persist_snapshot(&self) -> Result<()> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };
        let applied = self.applied_index();
        if applied == 0 {
            return Ok(());
        }

        let data = self.capture_snapshot_data(applied)?;
        persist_snapshot_file(&path, &data.encode()?)?;
        debug!(path = %path.display(), index = applied, "snapshot persisted");
        Ok(())
    }

    fn raw_lock(&self) -> MutexGuard<'_, RawNode<MemStorage>> {
        self.raw.lock().expect("raft node lock poisoned")
    }

    fn register_proposal(&self) -> (u64, oneshot::Receiver<LogIndex>) {
        let proposal_id = self.next_proposal_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(proposal_id, tx);
        (proposal_id, rx)
    }

    fn abandon_proposal(&self, proposal_id: u64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&proposal_id);
    }

    fn map_propose_error(&self, error: raft::Error) -> Error {
        match error {
            raft::Error::ProposalDropped => Error::NotLeader {
                leader: self.leader_id(),
            },
            other => Error::Raft(other.to_string()),
        }
    }

    fn update_leader(&self, leader: u64) {
        if leader == raft::INVALID_ID {
            self.has_leader.store(false, Ordering::Release);
        } else {
            self.leader_id.store(leader, Ordering::Release);
            self.has_leader.store(true, Ordering::Release);
        }
    }

    /// Applies committed entries in order, resolving pending proposals.
    fn apply_entries(&self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            if entry.data.is_empty() {
                // Leader-election marker; consumes an index, carries nothing
                self.applied.store(entry.index, Ordering::Release);
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    let mut fsm = self.fsm.lock().expect("state machine lock poisoned");
                    match fsm.apply(entry.index, entry.data.as_ref()) {
                        Ok(_) => {}
                        Err(Error::Storage(reason)) => {
                            // Redelivery of an already applied entry; skipping
                            // keeps the map consistent
                            warn!(index = entry.index, %reason, "skipping stale entry");
                        }
                        Err(fatal) => return Err(fatal),
                    }
                }
                EntryType::EntryConfChange => {
                    self.apply_conf_change(&entry)?;
                }
                EntryType::EntryConfChangeV2 => {
                    // Never proposed by this engine
                    warn!(index = entry.index, "skipping unexpected conf change v2 entry");
                }
            }

            self.applied.store(entry.index, Ordering::Release);
            self.resolve_proposal(entry.context.as_ref(), entry.index);
        }
        Ok(())
    }

    /// Applies one committed membership entry: updates the raft
    /// configuration, the conf state in storage, and the address book.
    fn apply_conf_change(&self, entry: &Entry) -> Result<()> {
        let change = ConfChange::decode(&entry.data[..])
            .map_err(|e| Error::ApplyDecode(format!("conf change entry {}: {e}", entry.index)))?;

        let conf_state = self
            .raw_lock()
            .apply_conf_change(&change)
            .map_err(|e| Error::Raft(e.to_string()))?;
        self.storage.set_conf_state(conf_state);

        match change.get_change_type() {
            ConfChangeType::AddNode => {
                if !change.context.is_empty() {
                    match Command::decode(change.context.as_ref()) {
                        Ok(Command::AddVoter { node_id, addr }) => {
                            info!(node = node_id, %addr, "voter admitted");
                            self.update_member_addr(node_id, addr);
                        }
                        Ok(other) => {
                            warn!(?other, "ignoring non-membership conf change context");
                        }
                        Err(e) => {
                            return Err(Error::ApplyDecode(format!(
                                "conf change context at {}: {e}",
                                entry.index
                            )));
                        }
                    }
                }
            }
            ConfChangeType::RemoveNode => {
                info!(node = change.node_id, "voter removed");
                self.members
                    .write()
                    .expect("membership lock poisoned")
                    .remove(&change.node_id);
                self.transport.remove_peer(change.node_id);
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_proposal(&self, context: &[u8], index: LogIndex) {
        let Ok(bytes) = <[u8; 8]>::try_from(context) else {
            return;
        };
        let proposal_id = u64::from_be_bytes(bytes);
        if let Some(tx) = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&proposal_id)
        {
            // The proposer may have timed out and gone away; that's fine
            let _ = tx.send(index);
        }
    }

    /// Installs a snapshot received from the leader: resets storage, restores
    /// the state machine, and adopts the snapshot's membership.
    fn install_received_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let data = SnapshotData::decode(snapshot.data.as_ref())
            .map_err(|e| Error::ApplyDecode(format!("snapshot at {index}: {e}")))?;
        info!(index, "installing snapshot from leader");

        self.storage
            .apply_snapshot(snapshot)
            .map_err(|e| Error::Storage(e.to_string()))?;

        {
            let mut fsm = self.fsm.lock().expect("state machine lock poisoned");
            fsm.restore(&data)?;
            fsm.advance_applied(index);
        }
        self.applied.store(index, Ordering::Release);

        for (id, addr) in &data.members {
            if *id != self.id {
                self.transport.add_peer(*id, addr.clone());
            }
        }
        *self.members.write().expect("membership lock poisoned") = data.members;
        Ok(())
    }

    /// Captures the current state as snapshot data covering `applied`.
    fn capture_snapshot_data(&self, applied: LogIndex) -> Result<SnapshotData> {
        let term = self.storage.term(applied).unwrap_or_default();
        let mut data = {
            let fsm = self.fsm.lock().expect("state machine lock poisoned");
            fsm.snapshot(self.membership())?
        };
        data.last_applied = applied;
        data.term = term;
        Ok(data)
    }

    /// Creates a snapshot and compacts the log once enough entries have been
    /// applied since the last compaction point.
    fn maybe_snapshot(&self) -> Result<()> {
        let applied = self.applied_index();
        if applied == 0 {
            return Ok(());
        }
        if applied - self.storage.compacted_index() < self.config.snapshot_interval_entries {
            return Ok(());
        }

        let data = self.capture_snapshot_data(applied)?;
        let bytes = data.encode()?;

        self.storage
            .install_snapshot(raft_snapshot(&data)?)
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.storage
            .compact(applied)
            .map_err(|e| Error::Storage(e.to_string()))?;

        if let Some(path) = &self.snapshot_path {
            persist_snapshot_file(path, &bytes)?;
        }
        info!(index = applied, "snapshot created and log compacted");
        Ok(())
    }
}

/// Builds the raft-level snapshot message for serialized snapshot data.
fn raft_snapshot(data: &SnapshotData) -> Result<Snapshot> {
    let mut voters: Vec<NodeId> = data.members.keys().copied().collect();
    voters.sort_unstable();
    let mut conf_state = raft::eraftpb::ConfState::default();
    conf_state.voters = voters;

    let mut metadata = SnapshotMetadata::default();
    metadata.index = data.last_applied;
    metadata.term = data.term;
    metadata.conf_state = Some(conf_state);

    let mut snapshot = Snapshot::default();
    snapshot.data = data.encode()?.into();
    snapshot.metadata = Some(metadata);
    Ok(snapshot)
}

/// Atomically replaces the snapshot file (write-then-rename).
fn persist_snapshot_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("bin.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
