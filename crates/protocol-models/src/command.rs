//! Command records and the requests that create them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CommandId;
use crate::outcome::{CommandError, CommandOutcome, CommandResult};
use crate::params::{CommandParams, CommandType};

/// Lane a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandIntent {
    /// The protocol body.
    Protocol,
    /// Runs before the protocol body, e.g. homing and loads.
    Setup,
    /// Operator-injected while the run awaits recovery.
    Fixit,
}

impl fmt::Display for CommandIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandIntent::Protocol => write!(f, "protocol"),
            CommandIntent::Setup => write!(f, "setup"),
            CommandIntent::Fixit => write!(f, "fixit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Succeeded | CommandStatus::Failed)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Queued => write!(f, "queued"),
            CommandStatus::Running => write!(f, "running"),
            CommandStatus::Succeeded => write!(f, "succeeded"),
            CommandStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a caller hands to `enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(flatten)]
    pub params: CommandParams,
    #[serde(default = "default_intent")]
    pub intent: CommandIntent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_intent() -> CommandIntent {
    CommandIntent::Protocol
}

impl CommandRequest {
    pub fn new(params: CommandParams, intent: CommandIntent) -> Self {
        Self {
            params,
            intent,
            key: None,
        }
    }

    pub fn protocol(params: CommandParams) -> Self {
        Self::new(params, CommandIntent::Protocol)
    }

    pub fn setup(params: CommandParams) -> Self {
        Self::new(params, CommandIntent::Setup)
    }

    pub fn fixit(params: CommandParams) -> Self {
        Self::new(params, CommandIntent::Fixit)
    }

    /// Sets the caller-supplied identity key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A command as tracked by the queue. Only the queue changes `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub key: String,
    pub intent: CommandIntent,
    #[serde(flatten)]
    pub params: CommandParams,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    /// For fixit commands, the failed command they were queued to remedy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_command_id: Option<CommandId>,
}

impl Command {
    /// Creates a queued command from a request. The key defaults to the ID.
    pub fn from_request(request: CommandRequest) -> Self {
        let id = CommandId::new();
        let key = request.key.unwrap_or_else(|| id.to_string());
        Self {
            id,
            key,
            intent: request.intent,
            params: request.params,
            status: CommandStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            failed_command_id: None,
        }
    }

    pub fn command_type(&self) -> CommandType {
        self.params.command_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the command as running.
    pub fn start(&mut self) {
        self.status = CommandStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Records the terminal outcome.
    pub fn finish(&mut self, outcome: CommandOutcome) {
        match outcome {
            CommandOutcome::Succeeded(result) => {
                self.status = CommandStatus::Succeeded;
                self.result = Some(result);
            }
            CommandOutcome::Failed(error) => {
                self.status = CommandStatus::Failed;
                self.error = Some(error);
            }
        }
        self.completed_at = Some(Utc::now());
    }

    /// Outcome of a terminal command, `None` while queued or running.
    pub fn outcome(&self) -> Option<CommandOutcome> {
        match self.status {
            CommandStatus::Succeeded => Some(CommandOutcome::Succeeded(
                self.result.clone().unwrap_or_default(),
            )),
            CommandStatus::Failed => self.error.clone().map(CommandOutcome::Failed),
            CommandStatus::Queued | CommandStatus::Running => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{DefinedError, ErrorType};
    use crate::params::{CommentParams, HomeParams};

    fn comment() -> CommandParams {
        CommandParams::Comment(CommentParams {
            message: "hello".into(),
        })
    }

    #[test]
    fn test_key_defaults_to_id() {
        let command = Command::from_request(CommandRequest::protocol(comment()));
        assert_eq!(command.key, command.id.as_str());
        assert_eq!(command.status, CommandStatus::Queued);

        let keyed = Command::from_request(CommandRequest::setup(comment()).with_key("step-1"));
        assert_eq!(keyed.key, "step-1");
        assert_eq!(keyed.intent, CommandIntent::Setup);
    }

    #[test]
    fn test_lifecycle_fields() {
        let mut command = Command::from_request(CommandRequest::protocol(comment()));
        assert!(command.outcome().is_none());

        command.start();
        assert_eq!(command.status, CommandStatus::Running);
        assert!(command.started_at.is_some());

        command.finish(CommandOutcome::Failed(
            DefinedError::new(ErrorType::TipNotDetected, "no tip").into(),
        ));
        assert!(command.is_terminal());
        assert!(command.result.is_none());
        assert!(command.completed_at.is_some());
        assert!(matches!(command.outcome(), Some(CommandOutcome::Failed(_))));
    }

    #[test]
    fn test_request_deserializes_with_default_intent() {
        let request: CommandRequest =
            serde_json::from_str(r#"{"commandType":"home","params":{}}"#).unwrap();
        assert_eq!(request.intent, CommandIntent::Protocol);
        assert_eq!(request.params, CommandParams::Home(HomeParams::default()));

        let setup: CommandRequest =
            serde_json::from_str(r#"{"commandType":"home","params":{},"intent":"setup"}"#)
                .unwrap();
        assert_eq!(setup.intent, CommandIntent::Setup);
    }

    #[test]
    fn test_command_serializes_flat() {
        let command = Command::from_request(CommandRequest::protocol(comment()));
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["commandType"], "comment");
        assert_eq!(json["params"]["message"], "hello");
        assert_eq!(json["status"], "queued");
    }
}
