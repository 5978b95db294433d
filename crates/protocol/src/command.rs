//! Command types for the replicated log.
//!
//! This module defines the commands that flow through the Raft log. Commands
//! are serialized with bincode for storage in log entries. `Set` and `Delete`
//! are state machine commands applied to the key/value map; `AddVoter` is
//! membership traffic carried in configuration-change entries and must never
//! reach the state machine's apply path.

use maat_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur during command processing.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A membership command was routed to the state machine apply path.
    #[error("membership command cannot be applied to the state machine")]
    NotStateMachineCommand,
}

/// Result type for command methods.
pub type CommandResult<T> = Result<T, CommandError>;

/// Commands that flow through the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Set a key to a value, overwriting any existing value.
    Set {
        /// The key to set.
        key: String,
        /// The value to set.
        value: String,
    },
    /// Delete a key. Deleting an absent key is a no-op, not an error.
    Delete {
        /// The key to delete.
        key: String,
    },
    /// Admit a node as a voting member.
    ///
    /// Carried in the context of a configuration-change entry; the key/value
    /// state machine never applies it.
    AddVoter {
        /// The joining node's identifier.
        node_id: NodeId,
        /// The joining node's consensus-transport advertise address.
        addr: String,
    },
}

impl Command {
    /// Apply this command to the key/value state.
    ///
    /// Returns the response bytes: `"OK"` for `Set`, `"1"`/`"0"` for `Delete`
    /// depending on whether the key existed. `AddVoter` is rejected; the
    /// membership layer applies it, not the state machine.
    pub fn apply(&self, state: &mut BTreeMap<String, String>) -> CommandResult<Vec<u8>> {
        match self {
            Command::Set { key, value } => {
                state.insert(key.clone(), value.clone());
                Ok(b"OK".to_vec())
            }
            Command::Delete { key } => {
                if state.remove(key).is_some() {
                    Ok(b"1".to_vec())
                } else {
                    Ok(b"0".to_vec())
                }
            }
            Command::AddVoter { .. } => Err(CommandError::NotStateMachineCommand),
        }
    }

    /// Serialize this command to bytes for a log entry.
    pub fn encode(&self) -> CommandResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a command from log entry bytes.
    pub fn decode(bytes: &[u8]) -> CommandResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
