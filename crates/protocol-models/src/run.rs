//! Run lifecycle and run-level errors.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CommandId;
use crate::outcome::CommandError;

/// Lifecycle of a run.
///
/// ```text
/// Ready -> Running <-> PauseRequested -> Paused
///             |  \-> AwaitingRecovery --resume--> Running
///             |  \-> Finished | Failed
///             \-> StopRequested -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLifecycle {
    Ready,
    Running,
    PauseRequested,
    Paused,
    StopRequested,
    Stopped,
    AwaitingRecovery,
    Finished,
    Failed,
}

impl RunLifecycle {
    /// Stopped, Finished and Failed admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunLifecycle::Stopped | RunLifecycle::Finished | RunLifecycle::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunLifecycle::Ready => "ready",
            RunLifecycle::Running => "running",
            RunLifecycle::PauseRequested => "pause_requested",
            RunLifecycle::Paused => "paused",
            RunLifecycle::StopRequested => "stop_requested",
            RunLifecycle::Stopped => "stopped",
            RunLifecycle::AwaitingRecovery => "awaiting_recovery",
            RunLifecycle::Finished => "finished",
            RunLifecycle::Failed => "failed",
        }
    }
}

impl fmt::Display for RunLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the recovery policy decided after a command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryVerdict {
    /// Keep going with the next command.
    #[serde(alias = "IGNORE_AND_CONTINUE")]
    Continue,
    /// Park the run in `AwaitingRecovery` for operator fixit commands.
    WaitForRecovery,
    FailRun,
}

impl fmt::Display for RecoveryVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryVerdict::Continue => write!(f, "CONTINUE"),
            RecoveryVerdict::WaitForRecovery => write!(f, "WAIT_FOR_RECOVERY"),
            RecoveryVerdict::FailRun => write!(f, "FAIL_RUN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RunErrorKind {
    /// A command failed and the recovery policy chose to fail the run.
    CommandFailed { error: CommandError },
    /// The state store refused a command's outcome.
    StateInvariantViolation { detail: String },
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub command_id: CommandId,
    #[serde(flatten)]
    pub kind: RunErrorKind,
    pub occurred_at: DateTime<Utc>,
}

impl RunError {
    pub fn command_failed(command_id: CommandId, error: CommandError) -> Self {
        Self {
            command_id,
            kind: RunErrorKind::CommandFailed { error },
            occurred_at: Utc::now(),
        }
    }

    pub fn invariant_violation(command_id: CommandId, detail: impl Into<String>) -> Self {
        Self {
            command_id,
            kind: RunErrorKind::StateInvariantViolation {
                detail: detail.into(),
            },
            occurred_at: Utc::now(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RunErrorKind::CommandFailed { error } => {
                write!(f, "command {} failed: {}", self.command_id, error)
            }
            RunErrorKind::StateInvariantViolation { detail } => {
                write!(f, "state invariant violated by {}: {}", self.command_id, detail)
            }
        }
    }
}
