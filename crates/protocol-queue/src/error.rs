//! Error types for command queue operations.

use protocol_models::{CommandId, CommandIntent, CommandStatus, InvalidParams, RunLifecycle};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("command not found: {0}")]
    CommandNotFound(CommandId),

    /// `mark_running` on a command that is not queued.
    #[error("command {id} is not queued (status: {status})")]
    CommandNotQueued { id: CommandId, status: CommandStatus },

    /// `mark_terminal` on a command that is not running.
    #[error("command {id} is not running (status: {status})")]
    CommandNotRunning { id: CommandId, status: CommandStatus },

    /// Single-flight guard: another command is already in flight.
    #[error("command {running} is already running")]
    AnotherCommandRunning { running: CommandId },

    #[error("cannot enqueue {intent} command while run is {lifecycle}")]
    InvalidLaneTransition {
        intent: CommandIntent,
        lifecycle: RunLifecycle,
    },

    #[error("run is {0}; no more commands accepted")]
    RunTerminal(RunLifecycle),

    #[error(transparent)]
    InvalidParams(#[from] InvalidParams),

    /// The key was already used for a command with different params.
    #[error("command key already used: {0}")]
    DuplicateKey(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
