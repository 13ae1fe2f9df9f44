//! Event filtering for subscribers.

use protocol_models::RunId;

use crate::event::{RunEvent, RunEventKind};

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<RunId>,
    /// Empty means every kind.
    pub kinds: Vec<RunEventKind>,
    pub errors_only: bool,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_kind(mut self, kind: RunEventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }

    pub fn matches(&self, event: &RunEvent) -> bool {
        if let Some(ref run_id) = self.run_id {
            if event.run_id() != run_id {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind()) {
            return false;
        }
        !self.errors_only || event.is_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_models::CommandType;

    fn started(run: &str) -> RunEvent {
        RunEvent::CommandStarted {
            run_id: run.into(),
            command_id: "cmd-1".into(),
            command_type: CommandType::Home,
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(EventFilter::new().matches(&started("run-1")));
    }

    #[test]
    fn test_filter_by_run_and_kind() {
        let filter = EventFilter::new()
            .with_run_id("run-1".into())
            .with_kind(RunEventKind::CommandStarted);
        assert!(filter.matches(&started("run-1")));
        assert!(!filter.matches(&started("run-2")));

        let kinds = EventFilter::new().with_kind(RunEventKind::LifecycleChanged);
        assert!(!kinds.matches(&started("run-1")));
    }

    #[test]
    fn test_errors_only() {
        let filter = EventFilter::new().errors_only();
        assert!(!filter.matches(&started("run-1")));
        assert!(filter.matches(&RunEvent::StateInvariantViolated {
            run_id: "run-1".into(),
            command_id: "cmd-1".into(),
            detail: "bad".into(),
        }));
    }
}
