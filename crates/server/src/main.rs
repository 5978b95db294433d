//! Maat daemon: a distributed configuration store node.
//!
//! Starts the consensus-backed store, serves the HTTP join/key surface, and
//! optionally joins an existing cluster. A node started without `--join`
//! bootstraps a brand-new single-node cluster; with `--join` it starts
//! unconfigured and asks the target member to admit it.

mod http;

use anyhow::Context;
use clap::Parser;
use maat_raft::{NodeConfig, RaftConfig};
use maat_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Distributed configuration store node.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for snapshots and node state
    data_dir: PathBuf,

    /// Consensus transport bind address
    #[arg(long, default_value = "127.0.0.1:8786")]
    raft_addr: String,

    /// HTTP bind address for the join protocol and key surface
    #[arg(long, default_value = "127.0.0.1:8081")]
    http_addr: String,

    /// Address other nodes should use to reach this one (defaults to raft-addr)
    #[arg(long)]
    advertise: Option<String>,

    /// HTTP address of an existing member to join
    #[arg(long)]
    join: Option<String>,

    /// Node identifier (unsigned integer, unique within the cluster)
    #[arg(long)]
    id: u64,

    /// Keep all state in memory; never write to the data directory
    #[arg(long)]
    in_memory: bool,

    /// PEM certificate presented on the consensus transport
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long)]
    key: PathBuf,

    /// Optional CA bundle for verifying peer certificates
    #[arg(long)]
    ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if !args.in_memory {
        std::fs::create_dir_all(&args.data_dir)
            .with_context(|| format!("failed to create data dir {:?}", args.data_dir))?;
    }

    let node_config = NodeConfig {
        id: args.id,
        bind_addr: args.raft_addr.clone(),
        advertise_addr: args.advertise.clone(),
        data_dir: args.data_dir.clone(),
        in_memory: args.in_memory,
        cert_file: args.cert.clone(),
        key_file: args.key.clone(),
        ca_file: args.ca.clone(),
    };

    // No join target means this node forms its own cluster
    let bootstrap = args.join.is_none();
    let store = Arc::new(
        Store::open(node_config, RaftConfig::default(), bootstrap)
            .await
            .context("failed to open store")?,
    );

    let http_task = http::serve(args.http_addr.clone(), store.clone())
        .await
        .context("failed to start HTTP service")?;

    if let Some(join_addr) = &args.join {
        join_cluster(join_addr, &store)
            .await
            .with_context(|| format!("failed to join cluster via {join_addr}"))?;
        info!(target = %join_addr, "join request accepted");
    }

    info!("maat started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("maat exiting");

    http_task.abort();
    let _ = http_task.await;
    match Arc::try_unwrap(store) {
        Ok(store) => store.shutdown().await?,
        Err(_still_shared) => warn!("store still shared at exit; skipping graceful shutdown"),
    }
    Ok(())
}

/// Sends this node's `(id, addr)` to an existing member's join endpoint.
async fn join_cluster(join_addr: &str, store: &Store) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "addr": store.local_addr().to_string(),
        "id": store.node_id().to_string(),
    });
    let url = format!("http://{join_addr}/join");

    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("join request to {url}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        anyhow::bail!("join request to {url} failed: {status} {detail}");
    }
    Ok(())
}
