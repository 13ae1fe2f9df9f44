//! RunHandle - the caller-facing side of one run.

use std::sync::Arc;

use protocol_events::{EventBus, EventFilter, RunEvent, Subscription};
use protocol_models::{
    Command, CommandId, CommandRequest, CommandStatus, RunId, RunLifecycle,
};
use protocol_persistence::RunJournal;
use protocol_queue::{CommandFilter, CommandQueue, CommandSlice, CurrentCommand};
use protocol_state::{StateSnapshot, StateStore};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::{RunController, RunStatus};
use crate::dispatcher::HardwareDispatcher;
use crate::error::{EngineError, Result};
use crate::executor::Executor;
use crate::policy::RecoveryPolicy;

/// Command tallies by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCounts {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl CommandCounts {
    fn tally(commands: &[Command]) -> Self {
        let mut counts = Self {
            total: commands.len(),
            ..Self::default()
        };
        for command in commands {
            match command.status {
                CommandStatus::Queued => counts.queued += 1,
                CommandStatus::Running => counts.running += 1,
                CommandStatus::Succeeded => counts.succeeded += 1,
                CommandStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// Short report on a run, e.g. once it ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    #[serde(flatten)]
    pub status: RunStatus,
    pub commands: CommandCounts,
}

/// Everything a reader needs to render a run at one instant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_command: Option<CurrentCommand>,
    pub commands: CommandCounts,
    pub state: StateSnapshot,
}

struct RunInner {
    run_id: RunId,
    controller: Arc<RunController>,
    queue: CommandQueue,
    snapshots: watch::Receiver<Arc<StateSnapshot>>,
    journal: Arc<dyn RunJournal>,
    events: EventBus<RunEvent>,
    policy: Arc<RecoveryPolicy>,
    work: Arc<Notify>,
    executor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a run. Cloning shares the run.
///
/// Control requests and reads are safe from any task. Only the run's
/// executor changes command status or state.
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<RunInner>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.inner.run_id)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl RunHandle {
    /// Creates a READY run and spawns its executor. Must be called inside a
    /// tokio runtime.
    pub(crate) fn start(
        policy: RecoveryPolicy,
        dispatcher: Arc<dyn HardwareDispatcher>,
        journal: Arc<dyn RunJournal>,
        events: EventBus<RunEvent>,
    ) -> Self {
        let run_id = RunId::new();
        let controller = Arc::new(RunController::new(
            run_id.clone(),
            events.clone(),
            Arc::clone(&journal),
        ));
        let queue = CommandQueue::new();
        let state = Arc::new(StateStore::new());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(StateSnapshot::default()));
        let policy = Arc::new(policy);
        let work = Arc::new(Notify::new());

        if let Err(e) = journal.record_lifecycle(&run_id, RunLifecycle::Ready) {
            warn!(run_id = %run_id, error = %e, "failed to journal new run");
        }

        let executor = Executor {
            run_id: run_id.clone(),
            controller: Arc::clone(&controller),
            queue: queue.clone(),
            state,
            snapshots: snapshot_tx,
            dispatcher,
            journal: Arc::clone(&journal),
            events: events.clone(),
            policy: Arc::clone(&policy),
            work: Arc::clone(&work),
        };
        let handle = tokio::spawn(executor.run());
        info!(run_id = %run_id, "run created");

        Self {
            inner: Arc::new(RunInner {
                run_id,
                controller,
                queue,
                snapshots: snapshot_rx,
                journal,
                events,
                policy,
                work,
                executor: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.inner.policy
    }

    /// Adds a command to the lane its intent selects.
    ///
    /// Setup commands are only accepted before the first `play`, fixit
    /// commands only while awaiting recovery, where they run straight away.
    /// A keyed request that was already enqueued returns the existing
    /// command.
    pub fn enqueue(&self, request: CommandRequest) -> Result<Command> {
        let known = match &request.key {
            Some(key) => self.inner.queue.get_by_key(key)?.is_some(),
            None => false,
        };

        let command = self.inner.controller.with_status(|status| {
            self.inner
                .queue
                .enqueue(request, status.lifecycle, status.recovery_target.as_ref())
        })?;
        if known {
            return Ok(command);
        }

        if let Err(e) = self.inner.journal.append_command(&self.inner.run_id, &command) {
            warn!(run_id = %self.inner.run_id, error = %e, "failed to journal command");
        }
        self.inner.events.publish(RunEvent::CommandEnqueued {
            run_id: self.inner.run_id.clone(),
            command_id: command.id.clone(),
            command_type: command.command_type(),
            intent: command.intent,
        });
        self.inner.work.notify_one();
        Ok(command)
    }

    pub fn play(&self) -> Result<()> {
        self.inner.controller.play()
    }

    pub fn pause(&self) -> Result<()> {
        self.inner.controller.pause()
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.controller.stop()
    }

    /// Continues the protocol once every fixit command has finished.
    pub fn resume_from_recovery(&self) -> Result<()> {
        self.inner.controller.resume_from_recovery(&self.inner.queue)
    }

    pub fn status(&self) -> RunStatus {
        self.inner.controller.status()
    }

    pub fn lifecycle(&self) -> RunLifecycle {
        self.inner.controller.lifecycle()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.inner.controller.subscribe_status()
    }

    /// Latest state snapshot. Never waits on the executor.
    pub fn state(&self) -> Arc<StateSnapshot> {
        let snapshot = self.inner.snapshots.borrow();
        Arc::clone(&*snapshot)
    }

    pub fn command(&self, id: &CommandId) -> Result<Command> {
        Ok(self.inner.queue.get(id)?)
    }

    pub fn commands(&self, filter: &CommandFilter) -> Result<Vec<Command>> {
        Ok(self.inner.queue.list(filter)?)
    }

    /// Window of `length` commands starting at `cursor`, or ending at the
    /// current command when `cursor` is `None`.
    pub fn command_slice(&self, cursor: Option<usize>, length: usize) -> Result<CommandSlice> {
        Ok(self.inner.queue.slice(cursor, length)?)
    }

    pub fn current_command(&self) -> Result<Option<CurrentCommand>> {
        Ok(self.inner.queue.current()?)
    }

    pub fn snapshot(&self) -> Result<RunSnapshot> {
        let commands = self.inner.queue.list(&CommandFilter::new())?;
        Ok(RunSnapshot {
            run_id: self.inner.run_id.clone(),
            status: self.status(),
            current_command: self.inner.queue.current()?,
            commands: CommandCounts::tally(&commands),
            state: self.state().as_ref().clone(),
        })
    }

    pub fn summary(&self) -> Result<RunSummary> {
        let commands = self.inner.queue.list(&CommandFilter::new())?;
        Ok(RunSummary {
            run_id: self.inner.run_id.clone(),
            status: self.status(),
            commands: CommandCounts::tally(&commands),
        })
    }

    /// Raw receiver for events of every run on this engine.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Calls `callback` for this run's events matching `filter`, off the
    /// executor's path.
    pub fn attach<F>(&self, filter: EventFilter, callback: F) -> Subscription
    where
        F: FnMut(RunEvent) + Send + 'static,
    {
        let filter = filter.with_run_id(self.inner.run_id.clone());
        self.inner.events.attach_filtered(filter, callback)
    }

    /// Waits until `predicate` holds for the run status and returns it.
    pub async fn wait_until<F>(&self, mut predicate: F) -> RunStatus
    where
        F: FnMut(&RunStatus) -> bool,
    {
        let mut rx = self.subscribe_status();
        loop {
            {
                let status = rx.borrow_and_update();
                if predicate(&status) {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    pub async fn wait_for_lifecycle(&self, lifecycle: RunLifecycle) -> RunStatus {
        self.wait_until(|status| status.lifecycle == lifecycle).await
    }

    pub async fn wait_until_terminal(&self) -> RunStatus {
        self.wait_until(|status| status.lifecycle.is_terminal()).await
    }

    /// Stops a run that never started and waits for the executor to exit.
    ///
    /// Fails with `EngineConflict` if the run is past READY and not yet
    /// terminal.
    pub(crate) async fn shutdown(&self) -> Result<RunSummary> {
        match self.lifecycle() {
            RunLifecycle::Ready => {
                self.stop()?;
                self.wait_until_terminal().await;
            }
            lifecycle if lifecycle.is_terminal() => {}
            _ => {
                return Err(EngineError::EngineConflict {
                    active_run_id: self.inner.run_id.clone(),
                })
            }
        }

        if let Some(handle) = self.inner.executor.lock().await.take() {
            debug!(run_id = %self.inner.run_id, "waiting for executor to exit");
            handle
                .await
                .map_err(|e| EngineError::Executor(e.to_string()))?;
        }
        self.summary()
    }
}
