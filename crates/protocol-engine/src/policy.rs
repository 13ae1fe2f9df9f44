//! Error-recovery policy: what happens to a run when a command fails.
//!
//! [`decide`] is a pure function of the policy, the failed command and its
//! error. It never touches hardware, state or the clock.

use std::fs;
use std::path::Path;

use protocol_models::{
    Command, CommandIntent, CommandType, DefinedError, ErrorType, RecoveryVerdict,
};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One `(commandType, errorType) -> verdict` row. An unset field matches
/// anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<CommandType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    pub verdict: RecoveryVerdict,
}

impl RecoveryRule {
    pub fn new(
        command_type: Option<CommandType>,
        error_type: Option<ErrorType>,
        verdict: RecoveryVerdict,
    ) -> Self {
        Self {
            command_type,
            error_type,
            verdict,
        }
    }

    pub fn matches(&self, command_type: CommandType, error_type: ErrorType) -> bool {
        self.command_type.map_or(true, |t| t == command_type)
            && self.error_type.map_or(true, |e| e == error_type)
    }

    /// True if every failure this rule matches is already matched by `earlier`.
    fn shadowed_by(&self, earlier: &RecoveryRule) -> bool {
        let command_covered = match (earlier.command_type, self.command_type) {
            (None, _) => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
        };
        let error_covered = match (earlier.error_type, self.error_type) {
            (None, _) => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
        };
        command_covered && error_covered
    }
}

/// Recovery configuration for one run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPolicy {
    /// `false` fails the run on every error.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Evaluated top to bottom, first match wins.
    #[serde(default)]
    pub rules: Vec<RecoveryRule>,
    /// Error types that wait for recovery when no rule matches. Everything
    /// else fails the run.
    #[serde(default)]
    pub recoverable_error_types: Vec<ErrorType>,
}

fn default_enabled() -> bool {
    true
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            recoverable_error_types: Vec::new(),
        }
    }
}

impl RecoveryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every failure fails the run.
    pub fn never_recover() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_rule(
        mut self,
        command_type: Option<CommandType>,
        error_type: Option<ErrorType>,
        verdict: RecoveryVerdict,
    ) -> Self {
        self.rules
            .push(RecoveryRule::new(command_type, error_type, verdict));
        self
    }

    pub fn with_recoverable(mut self, error_type: ErrorType) -> Self {
        if !self.recoverable_error_types.contains(&error_type) {
            self.recoverable_error_types.push(error_type);
        }
        self
    }

    /// Verdict for a defined error on a protocol command, ignoring intent.
    pub fn verdict_for(&self, command_type: CommandType, error_type: ErrorType) -> RecoveryVerdict {
        if !self.enabled {
            return RecoveryVerdict::FailRun;
        }
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.matches(command_type, error_type))
        {
            return rule.verdict;
        }
        if self.recoverable_error_types.contains(&error_type) {
            RecoveryVerdict::WaitForRecovery
        } else {
            RecoveryVerdict::FailRun
        }
    }

    /// Rejects rules that can never fire because an earlier rule already
    /// matches everything they match.
    pub fn validate(&self) -> Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            if let Some(j) = self.rules[..i].iter().position(|earlier| rule.shadowed_by(earlier)) {
                return Err(EngineError::InvalidPolicy(format!(
                    "rule {} is unreachable: rule {} already matches every failure it matches",
                    i + 1,
                    j + 1
                )));
            }
        }
        Ok(())
    }

    /// Loads and validates a policy from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let policy_err = |reason: String| EngineError::PolicyFile {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| policy_err(e.to_string()))?;
        let policy: Self = serde_json::from_str(&text).map_err(|e| policy_err(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }
}

/// Decides what a failed command does to its run.
///
/// - no defined error (undefined failure): FAIL_RUN, never matched against rules
/// - policy disabled: FAIL_RUN
/// - setup command: FAIL_RUN
/// - fixit command: WAIT_FOR_RECOVERY, so the operator can try again
/// - otherwise the first matching rule, else the recoverable set, else FAIL_RUN
pub fn decide(
    policy: &RecoveryPolicy,
    failed: &Command,
    error: Option<&DefinedError>,
) -> RecoveryVerdict {
    let Some(error) = error else {
        return RecoveryVerdict::FailRun;
    };
    if !policy.enabled {
        return RecoveryVerdict::FailRun;
    }
    match failed.intent {
        CommandIntent::Setup => RecoveryVerdict::FailRun,
        CommandIntent::Fixit => RecoveryVerdict::WaitForRecovery,
        CommandIntent::Protocol => policy.verdict_for(failed.command_type(), error.error_type),
    }
}
