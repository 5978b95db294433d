//! Integration tests for the consensus engine.
//!
//! These tests verify end-to-end behavior across real TLS transports on
//! loopback: cluster bootstrap, leader election, command replication, and
//! membership changes.

use maat_protocol::Command;
use std::time::Duration;
use tempfile::TempDir;

mod common;

#[tokio::test]
async fn test_single_node_bootstrap_becomes_leader() {
    let dir = TempDir::new().unwrap();
    let cluster = common::spawn_node(&dir, 1, true).await;

    cluster.node.campaign().expect("campaign should succeed");
    let elected = common::wait_until(Duration::from_secs(5), || {
        let node = cluster.node.clone();
        async move { node.is_leader() }
    })
    .await;

    assert!(elected, "bootstrapped node should elect itself");
    assert_eq!(cluster.node.leader_id(), Some(1));
    cluster.stop();
}

#[tokio::test]
async fn test_leader_write_is_applied_locally() {
    let dir = TempDir::new().unwrap();
    let cluster = common::spawn_node(&dir, 1, true).await;
    cluster.node.campaign().unwrap();
    assert!(
        common::wait_until(Duration::from_secs(5), || {
            let node = cluster.node.clone();
            async move { node.is_leader() }
        })
        .await
    );

    let rx = cluster
        .node
        .propose(&Command::Set {
            key: "service/timeout".to_string(),
            value: "30s".to_string(),
        })
        .expect("leader should accept proposals");

    let index = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("proposal should commit before timeout")
        .expect("proposal channel should resolve");
    assert!(index > 0);
    assert_eq!(
        cluster.node.reader().get("service/timeout"),
        Some("30s".to_string())
    );

    cluster.stop();
}

#[tokio::test]
async fn test_two_node_replication_over_tls() {
    let dir = TempDir::new().unwrap();

    // Node 1 bootstraps a single-node cluster
    let first = common::spawn_node(&dir, 1, true).await;
    first.node.campaign().unwrap();
    assert!(
        common::wait_until(Duration::from_secs(5), || {
            let node = first.node.clone();
            async move { node.is_leader() }
        })
        .await
    );

    // Node 2 starts unconfigured, waiting to be admitted
    let second = common::spawn_node(&dir, 2, false).await;

    // The leader admits node 2 as a voter
    let rx = first
        .node
        .propose_add_voter(2, &second.addr())
        .expect("leader should accept membership changes");
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("membership change should commit")
        .expect("membership change channel should resolve");
    assert!(first.node.is_voter(2));

    // A write now needs both voters; committing proves replication works
    let rx = first
        .node
        .propose(&Command::Set {
            key: "replicated".to_string(),
            value: "yes".to_string(),
        })
        .expect("leader should accept proposals");
    tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("two-voter commit should succeed over the transport")
        .expect("proposal channel should resolve");

    // The follower applies the entry and serves it from its own map
    let replicated = common::wait_until(Duration::from_secs(10), || {
        let node = second.node.clone();
        async move { node.reader().get("replicated") == Some("yes".to_string()) }
    })
    .await;
    assert!(replicated, "follower should apply the replicated entry");

    // The follower also learned the full membership
    assert!(second.node.is_voter(1));
    assert!(second.node.is_voter(2));

    first.stop();
    second.stop();
}

#[tokio::test]
async fn test_delete_replicates_like_set() {
    let dir = TempDir::new().unwrap();
    let cluster = common::spawn_node(&dir, 1, true).await;
    cluster.node.campaign().unwrap();
    assert!(
        common::wait_until(Duration::from_secs(5), || {
            let node = cluster.node.clone();
            async move { node.is_leader() }
        })
        .await
    );

    let rx = cluster
        .node
        .propose(&Command::Set {
            key: "ephemeral".to_string(),
            value: "1".to_string(),
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.node.reader().get("ephemeral"), Some("1".to_string()));

    let rx = cluster
        .node
        .propose(&Command::Delete {
            key: "ephemeral".to_string(),
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.node.reader().get("ephemeral"), None);

    cluster.stop();
}
