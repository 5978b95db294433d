//! Raft consensus engine for the Maat distributed configuration store.
//!
//! This crate provides a consensus implementation built on top of `raft-rs`,
//! with in-memory log storage, a deterministic key/value state machine, and a
//! TLS transport whose server certificate can be rotated live through a
//! file-watching provider.

pub mod config;
pub mod node;
pub mod state_machine;
pub mod storage;
pub mod tls;
pub mod transport;

// Re-export main types for convenience
pub use config::{NodeConfig, RaftConfig};
pub use node::RaftNode;
pub use state_machine::{SnapshotData, StateMachine, StateReader};
pub use storage::MemStorage;
pub use tls::{CertificateProvider, CertificateWatcher};
pub use transport::RaftTransport;
