//! Error log sub-state.

use chrono::{DateTime, Utc};
use protocol_models::{CommandError, CommandId, StateChange};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub command_id: CommandId,
    pub error: CommandError,
    pub recorded_at: DateTime<Utc>,
}

/// Every command failure the store has seen, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorLog {
    pub entries: Vec<ErrorEntry>,
}

impl ErrorLog {
    pub fn last(&self) -> Option<&ErrorEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn apply(&mut self, change: &StateChange, at: DateTime<Utc>) {
        if let StateChange::ErrorRecorded { command_id, error } = change {
            // Same error replayed from a delta stream.
            if self.entries.iter().any(|e| e.error.id() == error.id()) {
                return;
            }
            self.entries.push(ErrorEntry {
                command_id: command_id.clone(),
                error: error.clone(),
                recorded_at: at,
            });
        }
    }
}
