//! Error types for the engine crate.

use std::fmt;
use std::path::PathBuf;

use protocol_models::{RunId, RunLifecycle};
use protocol_persistence::PersistenceError;
use protocol_queue::QueueError;
use protocol_state::StateError;
use thiserror::Error;

/// Operator control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Play,
    Pause,
    Stop,
    ResumeFromRecovery,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::Play => write!(f, "play"),
            ControlAction::Pause => write!(f, "pause"),
            ControlAction::Stop => write!(f, "stop"),
            ControlAction::ResumeFromRecovery => write!(f, "resume-from-recovery"),
        }
    }
}

/// Errors returned to callers of the engine's control surface.
///
/// None of these affect a run that is already executing; they reject the
/// requested operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A non-terminal run already owns the hardware.
    #[error("engine conflict: run {active_run_id} is still active")]
    EngineConflict { active_run_id: RunId },

    #[error("no active run")]
    EngineMissing,

    #[error("cannot {action} while run is {from}")]
    IllegalRunStateTransition {
        action: ControlAction,
        from: RunLifecycle,
    },

    /// Fixit commands are queued or running; they must finish before the
    /// protocol resumes.
    #[error("cannot resume from recovery while {pending} fixit command(s) are unfinished")]
    FixitCommandsPending { pending: usize },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("journal error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("invalid recovery policy: {0}")]
    InvalidPolicy(String),

    #[error("failed to load recovery policy {path}: {reason}")]
    PolicyFile { path: PathBuf, reason: String },

    /// The executor task panicked or was cancelled.
    #[error("executor task failed: {0}")]
    Executor(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
