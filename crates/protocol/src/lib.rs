//! Replicated-log command encoding for the Maat configuration store.
//!
//! This crate defines the commands that the consensus log carries and their
//! wire encoding. The state machine applies `Set`/`Delete`; `AddVoter` rides
//! configuration-change entries and is applied by the membership layer.
//!
//! # Example
//!
//! ```rust
//! use maat_protocol::Command;
//! use std::collections::BTreeMap;
//!
//! let mut state = BTreeMap::new();
//! let op = Command::Set {
//!     key: "region".to_string(),
//!     value: "us-east-1".to_string(),
//! };
//! let result = op.apply(&mut state).unwrap();
//! assert_eq!(result, b"OK");
//! ```

pub mod command;

// Re-export commonly used types for convenience
pub use command::{Command, CommandError, CommandResult};
