//! Consensus-backed key/value store for the Maat configuration store.
//!
//! The [`Store`] is the public façade over the consensus engine: writes are
//! proposed through the replicated log and acknowledged only after commit,
//! reads are served directly from the state machine's map, and cluster
//! membership changes go through the join protocol.
//!
//! Reads do not require leadership and may trail the most recent uncommitted
//! write (leader-local consistency, not linearizable). Writes and joins on a
//! non-leader fail with a `NotLeader` error carrying the leader hint so
//! callers can redirect.

use maat_common::{Error, NodeId, Result};
use maat_protocol::Command;
use maat_raft::{
    CertificateProvider, CertificateWatcher, NodeConfig, RaftConfig, RaftNode, RaftTransport,
    StateReader,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the inbound consensus message channel.
const INBOUND_QUEUE: usize = 1024;

/// The consensus-backed configuration store.
///
/// Opening a store starts the certificate provider and watcher, the TLS
/// transport, and the consensus loop. Dropping it (or calling
/// [`Store::shutdown`]) tears them down; shutdown additionally persists a
/// final snapshot when persistence is enabled.
pub struct Store {
    node: Arc<RaftNode>,
    reader: StateReader,
    transport: Arc<RaftTransport>,
    // Keeps the certificate file watch (and its reload task) alive
    _watcher: CertificateWatcher,
    shutdown_tx: watch::Sender<bool>,
    run_task: JoinHandle<()>,
    commit_timeout: Duration,
}

impl Store {
    /// Opens the store and starts its consensus machinery.
    ///
    /// With `bootstrap`, the node forms a brand-new single-node cluster with
    /// itself as sole voter and campaigns immediately. Without it, the node
    /// starts idle: it either recovers membership from existing on-disk
    /// state or waits for a leader to admit it via the join protocol.
    ///
    /// # Errors
    ///
    /// Construction-time failures are fatal and abort startup: invalid
    /// configuration, certificate load failure, or an unusable advertise
    /// address (`NotAdvertisable` / `NotTcp`).
    pub async fn open(
        node_config: NodeConfig,
        raft_config: RaftConfig,
        bootstrap: bool,
    ) -> Result<Store> {
        node_config.validate()?;
        raft_config.validate()?;

        // No valid certificate, no transport: this failure is fatal
        let provider = CertificateProvider::load(&node_config.cert_file, &node_config.key_file)?;
        let watcher = CertificateWatcher::spawn(provider.clone())?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let transport = RaftTransport::new(
            node_config.id,
            node_config.bind_addr.clone(),
            node_config.advertise_addr.clone(),
            provider,
            node_config.ca_file.as_deref(),
            raft_config.dial_timeout(),
            inbound_tx,
        )?;
        transport.start().await?;

        let node = RaftNode::new(&node_config, raft_config.clone(), transport.clone(), bootstrap)?;
        let reader = node.reader();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_task = tokio::spawn(node.clone().run(inbound_rx, shutdown_rx));

        if bootstrap {
            node.campaign()?;
        }

        info!(
            id = node_config.id,
            addr = %transport.local_addr(),
            bootstrap,
            "store opened"
        );

        Ok(Store {
            node,
            reader,
            transport,
            _watcher: watcher,
            shutdown_tx,
            run_task,
            commit_timeout: raft_config.commit_timeout(),
        })
    }

    /// This node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    /// The address peers and join requests should use for this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// True when this node currently leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    /// The current leader, if known.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.node.leader_id()
    }

    /// The leader's advertise address, if both leader and address are known.
    pub fn leader_addr(&self) -> Option<String> {
        self.node.member_addr(self.node.leader_id()?)
    }

    /// Current voter address book.
    pub fn membership(&self) -> std::collections::HashMap<NodeId, String> {
        self.node.membership()
    }

    /// Reads a key from the local state machine.
    ///
    /// Works on any node; the value may trail an uncommitted write on the
    /// leader.
    pub fn get(&self, key: &str) -> Option<String> {
        self.reader.get(key)
    }

    /// Sets a key, returning once the entry has committed.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.write(Command::Set {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    /// Deletes a key, returning once the entry has committed.
    /// Deleting an absent key commits a no-op.
    pub async fn delete(&self, key: impl Into<String>) -> Result<()> {
        self.write(Command::Delete { key: key.into() }).await
    }

    /// Admits `(id, addr)` as a voting member.
    ///
    /// Must be called on the leader. The exact pair already voting is
    /// rejected with `AlreadyMember`; a known voter re-joining from a new
    /// address only refreshes the address book (no quorum change).
    pub async fn join(&self, id: NodeId, addr: &str) -> Result<()> {
        if !self.node.is_leader() {
            return Err(Error::NotLeader {
                leader: self.node.leader_id(),
            });
        }

        if self.node.is_voter(id) {
            if self.node.member_addr(id).as_deref() == Some(addr) {
                return Err(Error::AlreadyMember {
                    id,
                    addr: addr.to_string(),
                });
            }
            info!(node = id, %addr, "voter re-joined with new address");
            self.node.update_member_addr(id, addr.to_string());
            return Ok(());
        }

        let rx = self.node.propose_add_voter(id, addr)?;
        self.await_commit(rx).await
    }

    /// Waits until some node is leader, returning its ID.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.node.leader_id() {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Raft("no leader elected within timeout".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stops the consensus loop and transport, persisting a final snapshot
    /// when persistence is enabled.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(error) = self.node.persist_snapshot() {
            warn!(%error, "failed to persist final snapshot");
        }

        let _ = self.shutdown_tx.send(true);
        let mut run_task = self.run_task;
        if tokio::time::timeout(Duration::from_secs(1), &mut run_task)
            .await
            .is_err()
        {
            run_task.abort();
        }
        self.transport.close();
        info!("store shut down");
        Ok(())
    }

    /// Routes a write through the log: leader check, propose, wait for
    /// commit bounded by the configured timeout.
    async fn write(&self, command: Command) -> Result<()> {
        if !self.node.is_leader() {
            return Err(Error::NotLeader {
                leader: self.node.leader_id(),
            });
        }

        let rx = self.node.propose(&command)?;
        self.await_commit(rx).await
    }

    async fn await_commit(&self, rx: oneshot::Receiver<u64>) -> Result<()> {
        match tokio::time::timeout(self.commit_timeout, rx).await {
            // Unknown outcome: the entry may still commit after this returns
            Err(_elapsed) => Err(Error::CommitTimeout),
            Ok(Err(_closed)) => Err(Error::Raft(
                "proposal abandoned before commit".to_string(),
            )),
            Ok(Ok(_index)) => Ok(()),
        }
    }
}
