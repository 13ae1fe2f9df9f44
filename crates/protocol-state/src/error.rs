//! Error types for state store operations.

use protocol_models::CommandId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// The command's outcome contradicts tracked state. Always fatal to a run.
    #[error("state invariant violated by {command_id}: {detail}")]
    InvariantViolation { command_id: CommandId, detail: String },

    /// Only terminal commands can be applied.
    #[error("command {0} has not finished")]
    CommandNotTerminal(CommandId),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl StateError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, StateError::InvariantViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
