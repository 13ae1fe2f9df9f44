//! Run lifecycle state machine.
//!
//! The lifecycle lives in a `tokio::sync::watch` channel. Every transition
//! is a compare-and-set through `send_if_modified`, so a rejected request
//! leaves no trace and an accepted one wakes the executor and every other
//! status watcher at once.
//!
//! ```text
//! READY --play--> RUNNING --pause--> PAUSE_REQUESTED --(boundary)--> PAUSED --play--> RUNNING
//! RUNNING --(failure, WAIT_FOR_RECOVERY)--> AWAITING_RECOVERY --resumeFromRecovery--> RUNNING
//! AWAITING_RECOVERY runs fixit commands without leaving the state
//! any non-terminal --stop--> STOP_REQUESTED --(boundary)--> STOPPED
//! RUNNING --(queue empty)--> FINISHED
//! any non-terminal --(failure, FAIL_RUN)--> FAILED
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use protocol_events::{EventBus, RunEvent};
use protocol_models::{CommandId, RunError, RunId, RunLifecycle};
use protocol_persistence::RunJournal;
use protocol_queue::CommandQueue;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ControlAction, EngineError, Result};

/// Everything a caller needs to know about where a run stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub lifecycle: RunLifecycle,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The failed command the run is waiting to recover from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_target: Option<CommandId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_error: Option<RunError>,
}

impl RunStatus {
    fn new() -> Self {
        Self {
            lifecycle: RunLifecycle::Ready,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            recovery_target: None,
            run_error: None,
        }
    }

    fn enter(&mut self, lifecycle: RunLifecycle) {
        self.lifecycle = lifecycle;
        if lifecycle == RunLifecycle::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if lifecycle.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.recovery_target = None;
        }
    }
}

/// Owns a run's lifecycle.
///
/// Operator requests (`play`, `pause`, `stop`, `resume_from_recovery`) are
/// public. Settling a request at a command boundary and reacting to command
/// outcomes is reserved for the executor.
pub struct RunController {
    run_id: RunId,
    tx: watch::Sender<RunStatus>,
    events: EventBus<RunEvent>,
    journal: Arc<dyn RunJournal>,
}

impl RunController {
    pub fn new(run_id: RunId, events: EventBus<RunEvent>, journal: Arc<dyn RunJournal>) -> Self {
        let (tx, _) = watch::channel(RunStatus::new());
        Self {
            run_id,
            tx,
            events,
            journal,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.tx.borrow().clone()
    }

    pub fn lifecycle(&self) -> RunLifecycle {
        self.tx.borrow().lifecycle
    }

    /// Receiver that is notified on every transition.
    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.tx.subscribe()
    }

    /// Holds the status steady while `f` runs. Transitions wait until `f`
    /// returns, so `f` may act on the lifecycle it was given.
    pub(crate) fn with_status<T>(&self, f: impl FnOnce(&RunStatus) -> T) -> T {
        let status = self.tx.borrow();
        f(&status)
    }

    /// READY, PAUSED or PAUSE_REQUESTED -> RUNNING.
    pub fn play(&self) -> Result<()> {
        self.update(|status| match status.lifecycle {
            RunLifecycle::Ready | RunLifecycle::Paused | RunLifecycle::PauseRequested => {
                status.enter(RunLifecycle::Running);
                Ok(true)
            }
            RunLifecycle::Running => Ok(false),
            from => Err(illegal(ControlAction::Play, from)),
        })
    }

    /// RUNNING -> PAUSE_REQUESTED. The executor settles it after the
    /// in-flight command returns.
    pub fn pause(&self) -> Result<()> {
        self.update(|status| match status.lifecycle {
            RunLifecycle::Running => {
                status.enter(RunLifecycle::PauseRequested);
                Ok(true)
            }
            RunLifecycle::PauseRequested | RunLifecycle::Paused => Ok(false),
            from => Err(illegal(ControlAction::Pause, from)),
        })
    }

    /// Any non-terminal lifecycle -> STOP_REQUESTED.
    pub fn stop(&self) -> Result<()> {
        self.update(|status| match status.lifecycle {
            RunLifecycle::StopRequested => Ok(false),
            from if from.is_terminal() => Err(illegal(ControlAction::Stop, from)),
            _ => {
                status.enter(RunLifecycle::StopRequested);
                Ok(true)
            }
        })
    }

    /// AWAITING_RECOVERY -> RUNNING, continuing with the protocol.
    ///
    /// Fixit commands run while the run is still awaiting recovery, so
    /// every one of them must have finished first. The check runs under the
    /// status lock; a fixit enqueued concurrently either counts or is
    /// rejected for arriving after recovery ended.
    pub fn resume_from_recovery(&self, queue: &CommandQueue) -> Result<()> {
        self.update(|status| match status.lifecycle {
            RunLifecycle::AwaitingRecovery => {
                let pending = queue.pending_fixits()?;
                if pending > 0 {
                    return Err(EngineError::FixitCommandsPending { pending });
                }
                status.recovery_target = None;
                status.enter(RunLifecycle::Running);
                Ok(true)
            }
            from => Err(illegal(ControlAction::ResumeFromRecovery, from)),
        })
    }

    pub(crate) fn settle_pause(&self) -> Result<()> {
        self.transition_from(&[RunLifecycle::PauseRequested], RunLifecycle::Paused)
    }

    pub(crate) fn settle_stop(&self) -> Result<()> {
        self.transition_from(&[RunLifecycle::StopRequested], RunLifecycle::Stopped)
    }

    /// A `waitForResume` command completed.
    pub(crate) fn pause_for_operator(&self) -> Result<()> {
        self.transition_from(
            &[RunLifecycle::Running, RunLifecycle::PauseRequested],
            RunLifecycle::Paused,
        )
    }

    /// RUNNING -> FINISHED, if no lane has work left.
    ///
    /// The check runs while the status is locked, so a concurrent enqueue
    /// either lands before it (and the run keeps going) or sees the run
    /// finished and is rejected.
    pub(crate) fn finish_if_idle(&self, queue: &CommandQueue) -> Result<bool> {
        self.update(|status| {
            if status.lifecycle != RunLifecycle::Running
                || queue.next_eligible(RunLifecycle::Running)?.is_some()
            {
                return Ok(false);
            }
            status.enter(RunLifecycle::Finished);
            Ok(true)
        })
        .map(|_| self.lifecycle() == RunLifecycle::Finished)
    }

    /// Parks the run on `target`. Already in recovery, this only moves the
    /// target, e.g. onto a fixit command that failed.
    pub(crate) fn enter_recovery(&self, target: CommandId) -> Result<()> {
        self.update(|status| match status.lifecycle {
            RunLifecycle::Running
            | RunLifecycle::PauseRequested
            | RunLifecycle::AwaitingRecovery => {
                status.recovery_target = Some(target);
                status.enter(RunLifecycle::AwaitingRecovery);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    /// Any non-terminal lifecycle -> FAILED.
    pub(crate) fn fail(&self, error: RunError) -> Result<()> {
        self.update(|status| {
            if status.lifecycle.is_terminal() {
                return Ok(false);
            }
            status.run_error = Some(error);
            status.enter(RunLifecycle::Failed);
            Ok(true)
        })
    }

    fn transition_from(&self, allowed: &[RunLifecycle], to: RunLifecycle) -> Result<()> {
        self.update(|status| {
            if !allowed.contains(&status.lifecycle) {
                return Ok(false);
            }
            status.enter(to);
            Ok(true)
        })
    }

    /// Applies `f` as one compare-and-set. `f` returns `Ok(true)` to keep
    /// its changes; anything else restores the previous status.
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RunStatus) -> Result<bool>,
    {
        let mut outcome = Ok(());
        let mut changed = None;

        self.tx.send_if_modified(|status| {
            let before = status.clone();
            match f(status) {
                Ok(true) => {
                    if before.lifecycle != status.lifecycle {
                        changed = Some((before.lifecycle, status.lifecycle));
                    }
                    true
                }
                Ok(false) => {
                    *status = before;
                    false
                }
                Err(e) => {
                    *status = before;
                    outcome = Err(e);
                    false
                }
            }
        });

        if let Some((from, to)) = changed {
            self.announce(from, to);
        }
        outcome
    }

    fn announce(&self, from: RunLifecycle, to: RunLifecycle) {
        info!(run_id = %self.run_id, from = %from, to = %to, "run lifecycle changed");
        self.events.publish(RunEvent::LifecycleChanged {
            run_id: self.run_id.clone(),
            from,
            to,
            at: Utc::now(),
        });
        if let Err(e) = self.journal.record_lifecycle(&self.run_id, to) {
            warn!(run_id = %self.run_id, error = %e, "failed to journal lifecycle");
        }
    }
}

fn illegal(action: ControlAction, from: RunLifecycle) -> EngineError {
    EngineError::IllegalRunStateTransition { action, from }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_events::RunEventKind;
    use protocol_models::{
        CommandError, CommandOutcome, CommandParams, CommandRequest, CommandResult, CommentParams,
    };
    use protocol_persistence::{MemoryJournal, NoopJournal};

    fn controller() -> RunController {
        RunController::new(RunId::new(), EventBus::default(), Arc::new(NoopJournal))
    }

    fn assert_illegal(result: Result<()>, expected: ControlAction) {
        match result {
            Err(EngineError::IllegalRunStateTransition { action, .. }) => {
                assert_eq!(action, expected)
            }
            other => panic!("expected illegal transition, got {:?}", other),
        }
    }

    #[test]
    fn test_play_pause_settle() {
        let c = controller();
        c.play().unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Running);
        assert!(c.status().started_at.is_some());

        c.pause().unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::PauseRequested);
        c.pause().unwrap();
        c.settle_pause().unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Paused);

        c.play().unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Running);
    }

    #[test]
    fn test_play_cancels_pending_pause() {
        let c = controller();
        c.play().unwrap();
        c.pause().unwrap();
        c.play().unwrap();
        c.settle_pause().unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Running);
    }

    #[test]
    fn test_pause_rejected_outside_running() {
        let c = controller();
        assert_illegal(c.pause(), ControlAction::Pause);

        c.play().unwrap();
        c.enter_recovery(CommandId::new()).unwrap();
        assert_illegal(c.pause(), ControlAction::Pause);
    }

    #[test]
    fn test_play_rejected_while_awaiting_recovery() {
        let c = controller();
        c.play().unwrap();
        let target = CommandId::new();
        c.enter_recovery(target.clone()).unwrap();
        assert_eq!(c.status().recovery_target, Some(target));

        assert_illegal(c.play(), ControlAction::Play);
        assert_eq!(c.lifecycle(), RunLifecycle::AwaitingRecovery);

        c.resume_from_recovery(&CommandQueue::new()).unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Running);
        assert!(c.status().recovery_target.is_none());
    }

    #[test]
    fn test_resume_rejected_unless_awaiting_recovery() {
        let c = controller();
        let queue = CommandQueue::new();
        assert_illegal(c.resume_from_recovery(&queue), ControlAction::ResumeFromRecovery);
        c.play().unwrap();
        assert_illegal(c.resume_from_recovery(&queue), ControlAction::ResumeFromRecovery);
        assert_eq!(c.lifecycle(), RunLifecycle::Running);
    }

    #[test]
    fn test_resume_rejected_while_fixits_pending() {
        let c = controller();
        c.play().unwrap();
        let target = CommandId::new();
        c.enter_recovery(target.clone()).unwrap();

        let queue = CommandQueue::new();
        let fixit = queue
            .enqueue(
                CommandRequest::fixit(CommandParams::Comment(CommentParams {
                    message: "reseat the tip".into(),
                })),
                RunLifecycle::AwaitingRecovery,
                Some(&target),
            )
            .unwrap();

        let err = c.resume_from_recovery(&queue).unwrap_err();
        assert!(matches!(err, EngineError::FixitCommandsPending { pending: 1 }));
        assert_eq!(c.lifecycle(), RunLifecycle::AwaitingRecovery);
        assert_eq!(c.status().recovery_target, Some(target));

        queue.mark_running(&fixit.id).unwrap();
        assert!(c.resume_from_recovery(&queue).is_err());
        queue
            .mark_terminal(&fixit.id, CommandOutcome::Succeeded(CommandResult::Empty))
            .unwrap();
        c.resume_from_recovery(&queue).unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Running);
    }

    #[test]
    fn test_failed_fixit_moves_recovery_target() {
        let c = controller();
        c.play().unwrap();
        c.enter_recovery(CommandId::new()).unwrap();

        let fixit = CommandId::new();
        c.enter_recovery(fixit.clone()).unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::AwaitingRecovery);
        assert_eq!(c.status().recovery_target, Some(fixit));
    }

    #[test]
    fn test_stop_from_any_non_terminal() {
        let setups: [fn(&RunController); 4] = [
            |_: &RunController| {},
            |c: &RunController| c.play().unwrap(),
            |c: &RunController| {
                c.play().unwrap();
                c.pause().unwrap();
                c.settle_pause().unwrap();
            },
            |c: &RunController| {
                c.play().unwrap();
                c.enter_recovery(CommandId::new()).unwrap();
            },
        ];
        for setup in setups {
            let c = controller();
            setup(&c);
            c.stop().unwrap();
            assert_eq!(c.lifecycle(), RunLifecycle::StopRequested);
            c.stop().unwrap();
            c.settle_stop().unwrap();
            assert_eq!(c.lifecycle(), RunLifecycle::Stopped);
            assert!(c.status().completed_at.is_some());
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let c = controller();
        c.play().unwrap();
        c.fail(RunError::command_failed(
            CommandId::new(),
            CommandError::undefined("boom"),
        ))
        .unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Failed);
        assert!(c.status().run_error.is_some());

        assert_illegal(c.play(), ControlAction::Play);
        assert_illegal(c.stop(), ControlAction::Stop);
        assert_illegal(c.pause(), ControlAction::Pause);
        c.settle_stop().unwrap();
        c.enter_recovery(CommandId::new()).unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Failed);
    }

    #[test]
    fn test_fail_wins_over_stop_request() {
        let c = controller();
        c.play().unwrap();
        c.stop().unwrap();
        c.fail(RunError::invariant_violation(CommandId::new(), "no tip"))
            .unwrap();
        assert_eq!(c.lifecycle(), RunLifecycle::Failed);
    }

    #[test]
    fn test_finish_only_when_queue_is_empty() {
        let c = controller();
        let queue = CommandQueue::new();
        queue
            .enqueue(
                CommandRequest::protocol(CommandParams::Comment(CommentParams {
                    message: "hi".into(),
                })),
                RunLifecycle::Ready,
                None,
            )
            .unwrap();

        assert!(!c.finish_if_idle(&queue).unwrap());
        c.play().unwrap();
        assert!(!c.finish_if_idle(&queue).unwrap());
        assert!(c.finish_if_idle(&CommandQueue::new()).unwrap());
        assert_eq!(c.lifecycle(), RunLifecycle::Finished);
    }

    #[tokio::test]
    async fn test_transitions_are_published_and_journaled() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let journal = Arc::new(MemoryJournal::new());
        let c = RunController::new(RunId::new(), bus, journal.clone());
        let mut status_rx = c.subscribe_status();

        c.play().unwrap();
        c.play().unwrap();
        c.pause().unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), RunEventKind::LifecycleChanged);
        assert!(matches!(
            first,
            RunEvent::LifecycleChanged {
                from: RunLifecycle::Ready,
                to: RunLifecycle::Running,
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            RunEvent::LifecycleChanged {
                to: RunLifecycle::PauseRequested,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());

        assert!(status_rx.has_changed().unwrap());
        assert_eq!(
            status_rx.borrow_and_update().lifecycle,
            RunLifecycle::PauseRequested
        );

        let lifecycles = journal.contents().unwrap().lifecycles;
        assert_eq!(lifecycles.len(), 2);
    }
}
