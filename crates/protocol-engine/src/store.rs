//! EngineStore - at most one active run per robot.

use std::sync::Arc;

use protocol_events::{EventBus, RunEvent};
use protocol_persistence::{JsonJournal, NoopJournal, RunJournal};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::dispatcher::HardwareDispatcher;
use crate::error::{EngineError, Result};
use crate::policy::RecoveryPolicy;
use crate::run::{RunHandle, RunSummary};

/// Owns the robot's single run slot.
///
/// Constructed once per process and passed to whatever needs it. A second
/// `create_run` while a run is still active fails with `EngineConflict`,
/// which is what keeps two protocols off the same hardware.
pub struct EngineStore {
    config: EngineConfig,
    dispatcher: Arc<dyn HardwareDispatcher>,
    journal: Arc<dyn RunJournal>,
    events: EventBus<RunEvent>,
    active: Mutex<Option<RunHandle>>,
}

impl EngineStore {
    /// Journals to `config.journal_dir` when set.
    pub fn new(config: EngineConfig, dispatcher: Arc<dyn HardwareDispatcher>) -> Self {
        let journal: Arc<dyn RunJournal> = match &config.journal_dir {
            Some(dir) => Arc::new(JsonJournal::new(dir.clone())),
            None => Arc::new(NoopJournal),
        };
        Self::with_journal(config, dispatcher, journal)
    }

    pub fn with_journal(
        config: EngineConfig,
        dispatcher: Arc<dyn HardwareDispatcher>,
        journal: Arc<dyn RunJournal>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            dispatcher,
            journal,
            events,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a READY run with `policy`, or the configured default.
    ///
    /// A previous run that already ended is released without an explicit
    /// `clear`.
    pub async fn create_run(&self, policy: Option<RecoveryPolicy>) -> Result<RunHandle> {
        let policy = policy.unwrap_or_else(|| self.config.default_policy.clone());
        policy.validate()?;

        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            if !run.lifecycle().is_terminal() {
                return Err(EngineError::EngineConflict {
                    active_run_id: run.id().clone(),
                });
            }
            debug!(run_id = %run.id(), "releasing finished run");
        }

        let run = RunHandle::start(
            policy,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.journal),
            self.events.clone(),
        );
        *active = Some(run.clone());
        Ok(run)
    }

    pub async fn get_active_run(&self) -> Result<RunHandle> {
        self.active
            .lock()
            .await
            .clone()
            .ok_or(EngineError::EngineMissing)
    }

    /// Releases the active run and returns its final summary.
    ///
    /// Allowed once the run is terminal, or before it was ever played (the
    /// run is stopped first). Anything else is `EngineConflict`.
    pub async fn clear(&self) -> Result<RunSummary> {
        let mut active = self.active.lock().await;
        let run = active.as_ref().ok_or(EngineError::EngineMissing)?;
        let summary = run.shutdown().await?;
        info!(run_id = %summary.run_id, lifecycle = %summary.status.lifecycle, "run cleared");
        *active = None;
        Ok(summary)
    }

    /// Events from every run this engine creates.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus<RunEvent> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::SimulatingDispatcher;
    use protocol_models::{
        CommandParams, CommandRequest, CommandType, CommentParams, ErrorType, RecoveryVerdict,
        RunLifecycle,
    };
    use protocol_persistence::MemoryJournal;

    fn engine() -> EngineStore {
        EngineStore::new(EngineConfig::default(), Arc::new(SimulatingDispatcher::new()))
    }

    fn comment() -> CommandRequest {
        CommandRequest::protocol(CommandParams::Comment(CommentParams {
            message: "hello".into(),
        }))
    }

    #[tokio::test]
    async fn test_get_active_run_missing() {
        let engine = engine();
        assert!(matches!(
            engine.get_active_run().await,
            Err(EngineError::EngineMissing)
        ));
        assert!(matches!(engine.clear().await, Err(EngineError::EngineMissing)));
    }

    #[tokio::test]
    async fn test_clear_rejects_running_run() {
        let engine = engine();
        let run = engine.create_run(None).await.unwrap();
        run.enqueue(CommandRequest::protocol(CommandParams::WaitForResume(
            Default::default(),
        )))
        .unwrap();
        run.play().unwrap();
        run.wait_for_lifecycle(RunLifecycle::Paused).await;

        assert!(matches!(
            engine.clear().await,
            Err(EngineError::EngineConflict { .. })
        ));
        assert_eq!(engine.get_active_run().await.unwrap().id(), run.id());

        run.stop().unwrap();
        run.wait_until_terminal().await;
        let summary = engine.clear().await.unwrap();
        assert_eq!(summary.status.lifecycle, RunLifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_create_run_releases_terminal_run() {
        let engine = engine();
        let first = engine.create_run(None).await.unwrap();
        first.enqueue(comment()).unwrap();
        first.play().unwrap();
        first.wait_until_terminal().await;

        let second = engine.create_run(None).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(engine.get_active_run().await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_create_run_validates_policy() {
        let engine = engine();
        let policy = RecoveryPolicy::new()
            .with_rule(None, None, RecoveryVerdict::FailRun)
            .with_rule(
                Some(CommandType::Aspirate),
                Some(ErrorType::Overpressure),
                RecoveryVerdict::Continue,
            );
        assert!(matches!(
            engine.create_run(Some(policy)).await,
            Err(EngineError::InvalidPolicy(_))
        ));
        assert!(engine.get_active_run().await.is_err());
    }

    #[tokio::test]
    async fn test_runs_share_the_journal() {
        let journal = Arc::new(MemoryJournal::new());
        let engine = EngineStore::with_journal(
            EngineConfig::default(),
            Arc::new(SimulatingDispatcher::new()),
            journal.clone(),
        );
        let run = engine.create_run(None).await.unwrap();
        run.enqueue(comment()).unwrap();
        run.play().unwrap();
        run.wait_until_terminal().await;

        let contents = journal.contents().unwrap();
        assert!(contents.commands.iter().all(|(id, _)| id == run.id()));
        // enqueue, start, finish
        assert_eq!(contents.commands.len(), 3);
        assert_eq!(
            contents.lifecycles.last().map(|(_, l)| *l),
            Some(RunLifecycle::Finished)
        );
    }
}
