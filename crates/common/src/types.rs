//! Common type aliases used throughout Maat.
//!
//! This module defines fundamental type aliases for Raft consensus
//! and cluster management. Using type aliases provides semantic clarity
//! and makes it easier to change underlying types in the future if needed.

/// Unique identifier for a node in the cluster.
///
/// Each node in a Maat cluster has a unique `NodeId` assigned at startup.
/// Node IDs must be greater than 0 and are used throughout the system for:
/// - Raft consensus voting and leadership
/// - Cluster membership tracking
/// - Routing consensus traffic to the right peer
///
/// # Examples
///
/// ```
/// use maat_common::NodeId;
///
/// let node_id: NodeId = 1;
/// assert!(node_id > 0);
/// ```
pub type NodeId = u64;

/// Raft term number.
///
/// In Raft consensus, time is divided into terms of arbitrary length.
/// Terms act as a logical clock: each term begins with an election, and at
/// most one leader can be elected per term.
pub type Term = u64;

/// Index into the Raft log.
///
/// Each entry in the Raft log is identified by a unique `LogIndex`.
/// Log indices start at 1 (not 0) and increase monotonically; the index
/// combined with the term uniquely identifies a log entry.
pub type LogIndex = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        // Terms can be compared to detect stale information
        let old_term: Term = 3;
        let current_term: Term = 5;

        assert!(old_term < current_term);
    }

    #[test]
    fn test_log_index_range_check() {
        // Common pattern: checking if an index is within committed range
        let last_applied: LogIndex = 100;
        let commit_index: LogIndex = 120;
        let test_index: LogIndex = 110;

        assert!(test_index >= last_applied);
        assert!(test_index <= commit_index);
    }

    #[test]
    fn test_type_aliases_are_copy() {
        let node1: NodeId = 5;
        let node2 = node1;
        assert_eq!(node1, node2);
    }
}
