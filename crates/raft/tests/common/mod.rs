//! Common test utilities for consensus integration tests.
//!
//! This module provides helper functions for spinning up nodes with real TLS
//! transports on loopback, running their consensus loops, and waiting for
//! specific conditions.

use maat_raft::{CertificateProvider, NodeConfig, RaftConfig, RaftNode, RaftTransport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A node with its consensus loop running, ready for test traffic.
pub struct TestNode {
    pub node: Arc<RaftNode>,
    pub transport: Arc<RaftTransport>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestNode {
    /// Address peers should use to reach this node.
    pub fn addr(&self) -> String {
        self.transport.local_addr().to_string()
    }

    pub fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.transport.close();
        self.handle.abort();
    }
}

/// Timing tuned for tests: fast ticks, quick elections.
pub fn test_raft_config() -> RaftConfig {
    RaftConfig {
        tick_interval_ms: 10,
        election_tick: 10,
        heartbeat_tick: 3,
        snapshot_interval_entries: 1_000,
        commit_timeout_ms: 5_000,
        dial_timeout_ms: 1_000,
    }
}

/// Starts a node with a fresh self-signed certificate on a loopback port.
pub async fn spawn_node(dir: &TempDir, id: u64, bootstrap: bool) -> TestNode {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("certificate generation should succeed");
    let cert_file = dir.path().join(format!("node{id}.crt"));
    let key_file = dir.path().join(format!("node{id}.key"));
    std::fs::write(&cert_file, cert.cert.pem()).expect("write cert");
    std::fs::write(&key_file, cert.key_pair.serialize_pem()).expect("write key");

    let node_config = NodeConfig {
        id,
        bind_addr: "127.0.0.1:0".to_string(),
        advertise_addr: None,
        data_dir: dir.path().join(format!("node{id}")),
        in_memory: true,
        cert_file: cert_file.clone(),
        key_file: key_file.clone(),
        ca_file: None,
    };
    node_config.validate().expect("node config should be valid");

    let provider = CertificateProvider::load(&cert_file, &key_file).expect("provider");
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let transport = RaftTransport::new(
        id,
        node_config.bind_addr.clone(),
        None,
        provider,
        None,
        Duration::from_secs(1),
        inbound_tx,
    )
    .expect("transport");
    transport.start().await.expect("transport start");

    let node = RaftNode::new(&node_config, test_raft_config(), transport.clone(), bootstrap)
        .expect("node");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(node.clone().run(inbound_rx, shutdown_rx));

    TestNode {
        node,
        transport,
        shutdown_tx,
        handle,
    }
}

/// Polls `condition` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
