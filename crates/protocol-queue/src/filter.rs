//! Command filtering for history queries.

use protocol_models::{Command, CommandIntent, CommandStatus, CommandType};

#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub intent: Option<CommandIntent>,
    pub status: Option<CommandStatus>,
    pub command_type: Option<CommandType>,
}

impl CommandFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intent(mut self, intent: CommandIntent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_status(mut self, status: CommandStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_command_type(mut self, command_type: CommandType) -> Self {
        self.command_type = Some(command_type);
        self
    }

    pub fn matches(&self, command: &Command) -> bool {
        self.intent.map_or(true, |i| command.intent == i)
            && self.status.map_or(true, |s| command.status == s)
            && self
                .command_type
                .map_or(true, |t| command.command_type() == t)
    }
}
