//! Error types for the Maat distributed configuration store.
//!
//! This module defines the common error taxonomy used across all Maat crates.
//! Uses `thiserror` for ergonomic error handling. Every error a node can
//! surface is a named variant here rather than a process-wide sentinel.

use crate::types::NodeId;
use thiserror::Error;

/// Common error type for Maat operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Write or membership operation attempted on a non-leader node.
    ///
    /// Recoverable: the caller should redirect to the hinted leader.
    #[error("not leader{}", match .leader {
        Some(id) => format!(": current leader is node {id}"),
        None => String::new(),
    })]
    NotLeader {
        /// The current leader node ID, if known.
        leader: Option<NodeId>,
    },

    /// The resolved local address cannot be advertised to peers.
    ///
    /// Fatal at transport construction: an unspecified bind address
    /// (`0.0.0.0`-style) is not reachable by other cluster members.
    #[error("local bind address is not advertisable: {0}")]
    NotAdvertisable(String),

    /// The advertise address is not a concrete TCP `host:port` address.
    ///
    /// Fatal at transport construction.
    #[error("advertise address is not a TCP address: {0}")]
    NotTcp(String),

    /// Certificate or private key could not be loaded.
    ///
    /// Fatal at transport initialization; non-fatal (logged, last-known-good
    /// certificate keeps serving) on later reload attempts.
    #[error("certificate load failed: {0}")]
    CertificateLoad(String),

    /// A join request named a `(node id, address)` pair that already votes.
    #[error("node {id} at {addr} is already a cluster member")]
    AlreadyMember {
        /// Node ID from the duplicate join request.
        id: NodeId,
        /// Advertise address from the duplicate join request.
        addr: String,
    },

    /// A proposed entry did not commit within the configured bound.
    ///
    /// Ambiguous outcome: the entry may still commit later. Callers must
    /// treat this as "unknown", not "definitely failed".
    #[error("proposal did not commit within the configured timeout")]
    CommitTimeout,

    /// A committed log entry could not be decoded.
    ///
    /// Fatal: the node cannot keep applying an inconsistent log and must
    /// stop participating rather than diverge.
    #[error("committed entry decode failed: {0}")]
    ApplyDecode(String),

    /// Raft consensus error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Log storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that must abort node startup rather than be retried.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Error::NotAdvertisable(_) | Error::NotTcp(_) | Error::CertificateLoad(_)
        )
    }
}

/// Convenience type alias for Result with Maat Error.
pub type Result<T> = std::result::Result<T, Error>;
