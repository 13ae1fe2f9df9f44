//! Run notifications.

use chrono::{DateTime, Utc};
use protocol_models::{
    CommandError, CommandId, CommandIntent, CommandType, RecoveryVerdict, RunId, RunLifecycle,
};
use serde::Serialize;

/// Field-less mirror of [`RunEvent`] for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    LifecycleChanged,
    CommandEnqueued,
    CommandStarted,
    CommandSucceeded,
    CommandFailed,
    StateInvariantViolated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum RunEvent {
    #[serde(rename_all = "camelCase")]
    LifecycleChanged {
        run_id: RunId,
        from: RunLifecycle,
        to: RunLifecycle,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CommandEnqueued {
        run_id: RunId,
        command_id: CommandId,
        command_type: CommandType,
        intent: CommandIntent,
    },
    #[serde(rename_all = "camelCase")]
    CommandStarted {
        run_id: RunId,
        command_id: CommandId,
        command_type: CommandType,
    },
    #[serde(rename_all = "camelCase")]
    CommandSucceeded {
        run_id: RunId,
        command_id: CommandId,
        command_type: CommandType,
    },
    /// `verdict` is `None` when the policy was not consulted, e.g. a stop
    /// request was already pending.
    #[serde(rename_all = "camelCase")]
    CommandFailed {
        run_id: RunId,
        command_id: CommandId,
        command_type: CommandType,
        error: CommandError,
        verdict: Option<RecoveryVerdict>,
    },
    /// The in-memory model diverged from reality. Worth paging someone.
    #[serde(rename_all = "camelCase")]
    StateInvariantViolated {
        run_id: RunId,
        command_id: CommandId,
        detail: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            RunEvent::LifecycleChanged { run_id, .. }
            | RunEvent::CommandEnqueued { run_id, .. }
            | RunEvent::CommandStarted { run_id, .. }
            | RunEvent::CommandSucceeded { run_id, .. }
            | RunEvent::CommandFailed { run_id, .. }
            | RunEvent::StateInvariantViolated { run_id, .. } => run_id,
        }
    }

    pub fn command_id(&self) -> Option<&CommandId> {
        match self {
            RunEvent::LifecycleChanged { .. } => None,
            RunEvent::CommandEnqueued { command_id, .. }
            | RunEvent::CommandStarted { command_id, .. }
            | RunEvent::CommandSucceeded { command_id, .. }
            | RunEvent::CommandFailed { command_id, .. }
            | RunEvent::StateInvariantViolated { command_id, .. } => Some(command_id),
        }
    }

    pub fn kind(&self) -> RunEventKind {
        match self {
            RunEvent::LifecycleChanged { .. } => RunEventKind::LifecycleChanged,
            RunEvent::CommandEnqueued { .. } => RunEventKind::CommandEnqueued,
            RunEvent::CommandStarted { .. } => RunEventKind::CommandStarted,
            RunEvent::CommandSucceeded { .. } => RunEventKind::CommandSucceeded,
            RunEvent::CommandFailed { .. } => RunEventKind::CommandFailed,
            RunEvent::StateInvariantViolated { .. } => RunEventKind::StateInvariantViolated,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            RunEvent::CommandFailed { .. } | RunEvent::StateInvariantViolated { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let run_id = RunId::from_string("run-1");
        let event = RunEvent::StateInvariantViolated {
            run_id: run_id.clone(),
            command_id: "cmd-1".into(),
            detail: "no tip".into(),
        };
        assert_eq!(event.run_id(), &run_id);
        assert_eq!(event.command_id().unwrap().as_str(), "cmd-1");
        assert_eq!(event.kind(), RunEventKind::StateInvariantViolated);
        assert!(event.is_error());

        let event = RunEvent::LifecycleChanged {
            run_id,
            from: RunLifecycle::Ready,
            to: RunLifecycle::Running,
            at: Utc::now(),
        };
        assert!(event.command_id().is_none());
        assert!(!event.is_error());
    }

    #[test]
    fn test_serialization_tag() {
        let event = RunEvent::CommandStarted {
            run_id: "run-1".into(),
            command_id: "cmd-1".into(),
            command_type: CommandType::PickUpTip,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "commandStarted");
        assert_eq!(json["commandType"], "pickUpTip");
    }
}
