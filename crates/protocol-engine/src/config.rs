//! Engine configuration.

use std::path::PathBuf;

use protocol_events::DEFAULT_CAPACITY;

use crate::policy::RecoveryPolicy;

/// Configuration shared by every run an engine creates.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the run-event broadcast channel.
    pub event_capacity: usize,
    /// Policy used by runs created without an explicit one.
    pub default_policy: RecoveryPolicy,
    /// Where the JSON journal lives. `None` disables journaling.
    pub journal_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_CAPACITY,
            default_policy: RecoveryPolicy::default(),
            journal_dir: None,
        }
    }
}

impl EngineConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event channel capacity. Zero is bumped to one.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_default_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Enables the JSON journal under `dir`.
    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_models::{ErrorType, RecoveryVerdict};

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.event_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.default_policy, RecoveryPolicy::default());
        assert!(config.journal_dir.is_none());
    }

    #[test]
    fn test_config_builder() {
        let policy = RecoveryPolicy::new().with_rule(
            None,
            Some(ErrorType::TipNotDetected),
            RecoveryVerdict::WaitForRecovery,
        );
        let config = EngineConfig::new()
            .with_event_capacity(0)
            .with_default_policy(policy.clone())
            .with_journal_dir("/tmp/runs");

        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.default_policy, policy);
        assert_eq!(config.journal_dir, Some(PathBuf::from("/tmp/runs")));
    }
}
