//! The single loop that advances a run.
//!
//! One executor task runs per run. It is the only caller of
//! `mark_running`, `mark_terminal` and `StateStore::apply`, and it never has
//! more than one command in flight. Between commands it parks on the status
//! channel until the lifecycle says there is work to do.
//!
//! While the run awaits recovery the executor keeps going, but only on the
//! fixit lane. New fixit commands wake it through `work`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use protocol_events::{EventBus, RunEvent};
use protocol_models::{
    Command, CommandError, CommandId, CommandOutcome, CommandParams, CommandResult, Execution,
    RecoveryVerdict, RunError, RunId, RunLifecycle,
};
use protocol_persistence::RunJournal;
use protocol_queue::CommandQueue;
use protocol_state::{Applied, StateError, StateSnapshot, StateStore};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::controller::{RunController, RunStatus};
use crate::dispatcher::HardwareDispatcher;
use crate::error::{EngineError, Result};
use crate::policy::{decide, RecoveryPolicy};

pub(crate) struct Executor {
    pub(crate) run_id: RunId,
    pub(crate) controller: Arc<RunController>,
    pub(crate) queue: CommandQueue,
    pub(crate) state: Arc<StateStore>,
    pub(crate) snapshots: watch::Sender<Arc<StateSnapshot>>,
    pub(crate) dispatcher: Arc<dyn HardwareDispatcher>,
    pub(crate) journal: Arc<dyn RunJournal>,
    pub(crate) events: EventBus<RunEvent>,
    pub(crate) policy: Arc<RecoveryPolicy>,
    /// Signalled on every enqueue.
    pub(crate) work: Arc<Notify>,
}

impl Executor {
    /// Runs until the run reaches a terminal lifecycle.
    pub(crate) async fn run(self) {
        let mut status_rx = self.controller.subscribe_status();
        debug!(run_id = %self.run_id, "executor started");

        loop {
            let lifecycle = status_rx.borrow_and_update().lifecycle;
            let step = match lifecycle {
                RunLifecycle::Running => self.step().await,
                RunLifecycle::AwaitingRecovery => match self.queue.next_eligible(lifecycle) {
                    Ok(Some(fixit)) => self.execute(fixit).await,
                    Ok(None) => {
                        tokio::select! {
                            changed = status_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = self.work.notified() => {}
                        }
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                },
                RunLifecycle::PauseRequested => self.controller.settle_pause(),
                RunLifecycle::StopRequested => self.controller.settle_stop(),
                lifecycle if lifecycle.is_terminal() => break,
                _ => {
                    if status_rx.changed().await.is_err() {
                        break;
                    }
                    Ok(())
                }
            };
            if let Err(e) = step {
                self.abort(e);
                break;
            }
        }

        debug!(
            run_id = %self.run_id,
            lifecycle = %self.controller.lifecycle(),
            "executor stopped"
        );
    }

    async fn step(&self) -> Result<()> {
        match self.queue.next_eligible(RunLifecycle::Running)? {
            Some(command) => self.execute(command).await,
            None => self.controller.finish_if_idle(&self.queue).map(|_| ()),
        }
    }

    async fn execute(&self, queued: Command) -> Result<()> {
        let command = match self.queue.mark_running(&queued.id) {
            Ok(command) => command,
            Err(e) => return self.halt(&queued.id, e.to_string()),
        };
        self.record(&command);
        self.events.publish(RunEvent::CommandStarted {
            run_id: self.run_id.clone(),
            command_id: command.id.clone(),
            command_type: command.command_type(),
        });
        debug!(
            run_id = %self.run_id,
            command_id = %command.id,
            command_type = %command.command_type(),
            intent = %command.intent,
            "command started"
        );

        let outcome = match command.params.execution() {
            Execution::Internal => self.execute_internal(&command).await,
            Execution::Hardware => self.dispatch(&command).await,
        };

        let finished = match self.queue.mark_terminal(&command.id, outcome) {
            Ok(command) => command,
            Err(e) => return self.halt(&command.id, e.to_string()),
        };
        self.record(&finished);

        if let Err(detail) = self.apply(&finished) {
            self.publish_terminal(&finished, None);
            return self.halt(&finished.id, detail);
        }

        match &finished.error {
            None => {
                debug!(run_id = %self.run_id, command_id = %finished.id, "command succeeded");
                self.publish_terminal(&finished, None);
                if matches!(finished.params, CommandParams::WaitForResume(_)) {
                    self.controller.pause_for_operator()?;
                }
                Ok(())
            }
            Some(error) => self.handle_failure(&finished, error),
        }
    }

    async fn dispatch(&self, command: &Command) -> CommandOutcome {
        let state = match self.state.snapshot() {
            Ok(state) => state,
            Err(e) => return CommandOutcome::Failed(CommandError::undefined(e.to_string())),
        };

        let call = AssertUnwindSafe(self.dispatcher.execute(command, &state)).catch_unwind();
        match call.await {
            Ok(Ok(result)) => CommandOutcome::Succeeded(result),
            Ok(Err(e)) => e.into_outcome(),
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                error!(
                    run_id = %self.run_id,
                    command_id = %command.id,
                    panic = %detail,
                    "hardware dispatcher panicked"
                );
                CommandOutcome::Failed(CommandError::undefined(format!(
                    "dispatcher panicked: {}",
                    detail
                )))
            }
        }
    }

    /// Commands the engine handles without touching hardware.
    async fn execute_internal(&self, command: &Command) -> CommandOutcome {
        match &command.params {
            CommandParams::WaitForDuration(p) => {
                let duration = Duration::try_from_secs_f64(p.seconds).unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = stop_requested(self.controller.subscribe_status()) => {
                        debug!(command_id = %command.id, "wait cut short by stop request");
                    }
                }
            }
            CommandParams::WaitForResume(p) => {
                info!(
                    run_id = %self.run_id,
                    prompt = p.message.as_deref().unwrap_or(""),
                    "waiting for operator to resume"
                );
            }
            CommandParams::Comment(p) => {
                info!(run_id = %self.run_id, comment = %p.message, "protocol comment");
            }
            _ => {}
        }
        CommandOutcome::Succeeded(CommandResult::Empty)
    }

    /// Folds a finished command into state. Undefined failures are not
    /// applied: nobody knows what they did to the deck.
    fn apply(&self, command: &Command) -> std::result::Result<(), String> {
        if matches!(command.error, Some(CommandError::Undefined { .. })) {
            debug!(command_id = %command.id, "not applying undefined failure to state");
            return Ok(());
        }

        match self.state.apply(command) {
            Ok(Applied::Changed(delta)) => {
                if let Err(e) = self.journal.append_state_delta(&self.run_id, &delta) {
                    warn!(run_id = %self.run_id, error = %e, "failed to journal state delta");
                }
                let snapshot = self.state.snapshot().map_err(|e| e.to_string())?;
                self.snapshots.send_replace(snapshot);
                Ok(())
            }
            Ok(Applied::AlreadyApplied) => Ok(()),
            Err(StateError::InvariantViolation { detail, .. }) => Err(detail),
            Err(e) => Err(e.to_string()),
        }
    }

    fn handle_failure(&self, command: &Command, error: &CommandError) -> Result<()> {
        let verdict = match error.as_defined() {
            Some(_) if self.controller.lifecycle() == RunLifecycle::StopRequested => None,
            defined => Some(decide(&self.policy, command, defined)),
        };

        warn!(
            run_id = %self.run_id,
            command_id = %command.id,
            command_type = %command.command_type(),
            error = %error,
            verdict = ?verdict,
            "command failed"
        );
        self.publish_terminal(command, verdict);

        match verdict {
            None | Some(RecoveryVerdict::Continue) => Ok(()),
            Some(RecoveryVerdict::WaitForRecovery) => {
                self.controller.enter_recovery(command.id.clone())
            }
            Some(RecoveryVerdict::FailRun) => self
                .controller
                .fail(RunError::command_failed(command.id.clone(), error.clone())),
        }
    }

    /// The loop cannot continue. Fails the run so nobody waits on it forever.
    fn abort(&self, e: EngineError) {
        error!(run_id = %self.run_id, error = %e, "executor halted");
        // Blame the command in flight, else the last one touched. With a
        // broken queue neither is known and the run itself takes the blame.
        let command_id = self
            .queue
            .current()
            .ok()
            .flatten()
            .map(|current| current.command_id)
            .unwrap_or_else(|| CommandId::from_string(self.run_id.as_str()));
        if let Err(e) = self.halt(&command_id, format!("executor halted: {}", e)) {
            error!(run_id = %self.run_id, error = %e, "failed to fail halted run");
        }
    }

    /// Fails the run because engine bookkeeping and reality disagree.
    fn halt(&self, command_id: &CommandId, detail: String) -> Result<()> {
        error!(
            run_id = %self.run_id,
            command_id = %command_id,
            detail = %detail,
            "state invariant violated, failing run"
        );
        self.events.publish(RunEvent::StateInvariantViolated {
            run_id: self.run_id.clone(),
            command_id: command_id.clone(),
            detail: detail.clone(),
        });
        self.controller
            .fail(RunError::invariant_violation(command_id.clone(), detail))
    }

    fn publish_terminal(&self, command: &Command, verdict: Option<RecoveryVerdict>) {
        let event = match &command.error {
            None => RunEvent::CommandSucceeded {
                run_id: self.run_id.clone(),
                command_id: command.id.clone(),
                command_type: command.command_type(),
            },
            Some(error) => RunEvent::CommandFailed {
                run_id: self.run_id.clone(),
                command_id: command.id.clone(),
                command_type: command.command_type(),
                error: error.clone(),
                verdict,
            },
        };
        self.events.publish(event);
    }

    fn record(&self, command: &Command) {
        if let Err(e) = self.journal.append_command(&self.run_id, command) {
            warn!(run_id = %self.run_id, command_id = %command.id, error = %e, "failed to journal command");
        }
    }
}

async fn stop_requested(mut rx: watch::Receiver<RunStatus>) {
    loop {
        if rx.borrow_and_update().lifecycle == RunLifecycle::StopRequested {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
