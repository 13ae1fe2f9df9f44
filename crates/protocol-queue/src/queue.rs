//! CommandQueue - three ordered lanes over an append-only command history.
//!
//! - `Arc<Mutex<T>>` guards the whole queue so lane moves and status
//!   changes happen together
//! - lanes hold IDs only; the history owns the `Command` records
//! - at most one command is `Running` at any time

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use protocol_models::{
    Command, CommandError, CommandId, CommandIntent, CommandOutcome, CommandRequest,
    CommandStatus, RunLifecycle,
};
use serde::Serialize;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::filter::CommandFilter;

/// A window over the command history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSlice {
    pub commands: Vec<Command>,
    /// Index of the first command in the window.
    pub cursor: usize,
    pub total_length: usize,
}

/// Pointer to the command a run is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentCommand {
    pub command_id: CommandId,
    pub command_key: String,
    pub index: usize,
}

#[derive(Default)]
struct QueueState {
    /// Every command ever enqueued, in insertion order.
    history: Vec<Command>,
    index: HashMap<CommandId, usize>,
    keys: HashMap<String, usize>,
    setup: VecDeque<CommandId>,
    main: VecDeque<CommandId>,
    fixit: VecDeque<CommandId>,
    running: Option<CommandId>,
    last_finished: Option<CommandId>,
}

impl QueueState {
    fn lane_mut(&mut self, intent: CommandIntent) -> &mut VecDeque<CommandId> {
        match intent {
            CommandIntent::Setup => &mut self.setup,
            CommandIntent::Protocol => &mut self.main,
            CommandIntent::Fixit => &mut self.fixit,
        }
    }

    fn position(&self, id: &CommandId) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| QueueError::CommandNotFound(id.clone()))
    }

    fn push(&mut self, command: Command) {
        let position = self.history.len();
        self.index.insert(command.id.clone(), position);
        self.keys.insert(command.key.clone(), position);
        if command.status == CommandStatus::Queued {
            self.lane_mut(command.intent).push_back(command.id.clone());
        }
        self.history.push(command);
    }
}

/// Thread-safe three-lane command queue.
///
/// # Lane precedence
///
/// Which lanes `next_eligible` draws from depends on the run lifecycle:
///
/// - RUNNING: setup, then main
/// - AWAITING_RECOVERY: fixit only, so the operator's fixes run while main
///   progress is held
/// - anything else: nothing
///
/// Within a lane, FIFO.
///
/// # Example
///
/// ```no_run
/// use protocol_queue::CommandQueue;
/// use protocol_models::{CommandOutcome, CommandParams, CommandRequest, CommandResult, HomeParams, RunLifecycle};
///
/// let queue = CommandQueue::new();
/// let request = CommandRequest::setup(CommandParams::Home(HomeParams::default()));
/// queue.enqueue(request, RunLifecycle::Ready, None).unwrap();
///
/// while let Some(command) = queue.next_eligible(RunLifecycle::Running).unwrap() {
///     queue.mark_running(&command.id).unwrap();
///     queue
///         .mark_terminal(&command.id, CommandOutcome::Succeeded(CommandResult::Empty))
///         .unwrap();
/// }
/// ```
#[derive(Clone, Default)]
pub struct CommandQueue {
    state: Arc<Mutex<QueueState>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue from journaled history.
    ///
    /// Queued commands go back into their lanes. A command that was running
    /// when the journal stopped cannot be trusted to have finished, so it is
    /// marked failed with an undefined error.
    pub fn from_history(commands: Vec<Command>) -> Self {
        let mut state = QueueState::default();
        for mut command in commands {
            if command.status == CommandStatus::Running {
                command.finish(CommandOutcome::Failed(CommandError::undefined(
                    "command was in flight when the engine stopped",
                )));
            }
            state.push(command);
        }
        state.last_finished = state
            .history
            .iter()
            .filter(|c| c.is_terminal())
            .max_by_key(|c| c.completed_at)
            .map(|c| c.id.clone());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| QueueError::LockPoisoned(e.to_string()))
    }

    /// Validates and appends a command to the lane its intent selects.
    ///
    /// `lifecycle` is the run's lifecycle at the time of the call; the
    /// caller must hold it stable for the duration. `recovery_target` is
    /// recorded on fixit commands.
    ///
    /// Re-enqueueing a request whose key is already known returns the
    /// existing command untouched, as long as the params match.
    pub fn enqueue(
        &self,
        request: CommandRequest,
        lifecycle: RunLifecycle,
        recovery_target: Option<&CommandId>,
    ) -> Result<Command> {
        if lifecycle.is_terminal() {
            return Err(QueueError::RunTerminal(lifecycle));
        }
        let lane_allowed = match request.intent {
            CommandIntent::Protocol => true,
            CommandIntent::Setup => lifecycle == RunLifecycle::Ready,
            CommandIntent::Fixit => lifecycle == RunLifecycle::AwaitingRecovery,
        };
        if !lane_allowed {
            return Err(QueueError::InvalidLaneTransition {
                intent: request.intent,
                lifecycle,
            });
        }
        request.params.validate()?;

        let mut state = self.lock()?;
        if let Some(key) = &request.key {
            if let Some(&position) = state.keys.get(key) {
                let existing = &state.history[position];
                if existing.params == request.params && existing.intent == request.intent {
                    return Ok(existing.clone());
                }
                return Err(QueueError::DuplicateKey(key.clone()));
            }
        }

        let mut command = Command::from_request(request);
        if command.intent == CommandIntent::Fixit {
            command.failed_command_id = recovery_target.cloned();
        }
        debug!(
            command_id = %command.id,
            command_type = %command.command_type(),
            intent = %command.intent,
            "command enqueued"
        );
        state.push(command.clone());
        Ok(command)
    }

    /// Returns the command that should run next in `lifecycle`, or `None`
    /// when no lane open in that lifecycle has work.
    pub fn next_eligible(&self, lifecycle: RunLifecycle) -> Result<Option<Command>> {
        let state = self.lock()?;
        let next = match lifecycle {
            RunLifecycle::Running => state.setup.front().or_else(|| state.main.front()),
            RunLifecycle::AwaitingRecovery => state.fixit.front(),
            _ => None,
        };
        Ok(next.and_then(|id| state.index.get(id)).map(|&i| state.history[i].clone()))
    }

    /// Fixit commands not yet finished, counting one in flight.
    pub fn pending_fixits(&self) -> Result<usize> {
        let state = self.lock()?;
        let running = state
            .running
            .as_ref()
            .and_then(|id| state.index.get(id))
            .filter(|&&i| state.history[i].intent == CommandIntent::Fixit)
            .map_or(0, |_| 1);
        Ok(state.fixit.len() + running)
    }

    /// QUEUED -> RUNNING. Removes the command from its lane.
    pub fn mark_running(&self, id: &CommandId) -> Result<Command> {
        let mut state = self.lock()?;
        let position = state.position(id)?;

        let status = state.history[position].status;
        if status != CommandStatus::Queued {
            return Err(QueueError::CommandNotQueued {
                id: id.clone(),
                status,
            });
        }
        if let Some(running) = &state.running {
            return Err(QueueError::AnotherCommandRunning {
                running: running.clone(),
            });
        }

        let intent = state.history[position].intent;
        state.lane_mut(intent).retain(|queued| queued != id);
        state.running = Some(id.clone());

        let command = &mut state.history[position];
        command.start();
        Ok(command.clone())
    }

    /// RUNNING -> SUCCEEDED | FAILED.
    pub fn mark_terminal(&self, id: &CommandId, outcome: CommandOutcome) -> Result<Command> {
        let mut state = self.lock()?;
        let position = state.position(id)?;

        let status = state.history[position].status;
        if status != CommandStatus::Running {
            return Err(QueueError::CommandNotRunning {
                id: id.clone(),
                status,
            });
        }

        state.running = None;
        state.last_finished = Some(id.clone());
        let command = &mut state.history[position];
        command.finish(outcome);
        Ok(command.clone())
    }

    pub fn get(&self, id: &CommandId) -> Result<Command> {
        let state = self.lock()?;
        let position = state.position(id)?;
        Ok(state.history[position].clone())
    }

    pub fn get_by_key(&self, key: &str) -> Result<Option<Command>> {
        let state = self.lock()?;
        Ok(state.keys.get(key).map(|&i| state.history[i].clone()))
    }

    /// Commands in insertion order that match `filter`.
    pub fn list(&self, filter: &CommandFilter) -> Result<Vec<Command>> {
        let state = self.lock()?;
        Ok(state
            .history
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    /// Returns up to `length` commands starting at `cursor`.
    ///
    /// With no cursor, the window ends at the current command so callers
    /// polling a live run see what just happened.
    pub fn slice(&self, cursor: Option<usize>, length: usize) -> Result<CommandSlice> {
        let state = self.lock()?;
        let total_length = state.history.len();

        let cursor = match cursor {
            Some(c) => c.min(total_length),
            None => {
                let end = current_position(&state).map_or(total_length, |i| i + 1);
                end.saturating_sub(length)
            }
        };
        let end = cursor.saturating_add(length).min(total_length);

        Ok(CommandSlice {
            commands: state.history[cursor..end].to_vec(),
            cursor,
            total_length,
        })
    }

    /// The running command, else the most recently finished one.
    pub fn current(&self) -> Result<Option<CurrentCommand>> {
        let state = self.lock()?;
        Ok(current_position(&state).map(|index| {
            let command = &state.history[index];
            CurrentCommand {
                command_id: command.id.clone(),
                command_key: command.key.clone(),
                index,
            }
        }))
    }

    pub fn running_id(&self) -> Result<Option<CommandId>> {
        Ok(self.lock()?.running.clone())
    }

    /// Number of commands waiting in a lane.
    pub fn lane_len(&self, intent: CommandIntent) -> Result<usize> {
        let mut state = self.lock()?;
        Ok(state.lane_mut(intent).len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.history.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.history.is_empty())
    }
}

fn current_position(state: &QueueState) -> Option<usize> {
    state
        .running
        .as_ref()
        .or(state.last_finished.as_ref())
        .and_then(|id| state.index.get(id).copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_models::{
        CommandParams, CommandResult, CommentParams, DefinedError, ErrorType, HomeParams,
        LiquidHandlingParams, WellTarget,
    };

    fn comment(message: &str) -> CommandParams {
        CommandParams::Comment(CommentParams {
            message: message.to_string(),
        })
    }

    fn run_next(queue: &CommandQueue) -> Command {
        let command = queue.next_eligible(RunLifecycle::Running).unwrap().unwrap();
        queue.mark_running(&command.id).unwrap();
        queue
            .mark_terminal(&command.id, CommandOutcome::Succeeded(CommandResult::Empty))
            .unwrap()
    }

    fn message(command: &Command) -> String {
        match &command.params {
            CommandParams::Comment(p) => p.message.clone(),
            other => panic!("unexpected params {:?}", other),
        }
    }

    #[test]
    fn test_fifo_within_main_lane() {
        let queue = CommandQueue::new();
        for m in ["a", "b", "c"] {
            queue
                .enqueue(CommandRequest::protocol(comment(m)), RunLifecycle::Ready, None)
                .unwrap();
        }

        let order: Vec<String> = (0..3).map(|_| message(&run_next(&queue))).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.next_eligible(RunLifecycle::Running).unwrap().is_none());
    }

    #[test]
    fn test_setup_precedes_main() {
        let queue = CommandQueue::new();
        queue
            .enqueue(CommandRequest::protocol(comment("main")), RunLifecycle::Ready, None)
            .unwrap();
        queue
            .enqueue(CommandRequest::setup(comment("setup")), RunLifecycle::Ready, None)
            .unwrap();

        assert_eq!(message(&run_next(&queue)), "setup");
        assert_eq!(message(&run_next(&queue)), "main");
    }

    #[test]
    fn test_nothing_eligible_outside_running_or_recovery() {
        let queue = CommandQueue::new();
        queue
            .enqueue(CommandRequest::setup(comment("setup")), RunLifecycle::Ready, None)
            .unwrap();
        queue
            .enqueue(CommandRequest::protocol(comment("main")), RunLifecycle::Ready, None)
            .unwrap();

        for lifecycle in [
            RunLifecycle::Ready,
            RunLifecycle::Paused,
            RunLifecycle::PauseRequested,
            RunLifecycle::StopRequested,
            RunLifecycle::AwaitingRecovery,
        ] {
            assert!(queue.next_eligible(lifecycle).unwrap().is_none(), "{}", lifecycle);
        }
        assert_eq!(message(&run_next(&queue)), "setup");
    }

    #[test]
    fn test_fixit_only_eligible_while_awaiting_recovery() {
        let queue = CommandQueue::new();
        let failed = queue
            .enqueue(CommandRequest::protocol(comment("m1")), RunLifecycle::Ready, None)
            .unwrap();
        queue
            .enqueue(CommandRequest::protocol(comment("m2")), RunLifecycle::Ready, None)
            .unwrap();
        queue.mark_running(&failed.id).unwrap();
        queue
            .mark_terminal(
                &failed.id,
                CommandOutcome::Failed(
                    DefinedError::new(ErrorType::TipNotDetected, "no tip").into(),
                ),
            )
            .unwrap();

        let fixit = queue
            .enqueue(
                CommandRequest::fixit(comment("fix")),
                RunLifecycle::AwaitingRecovery,
                Some(&failed.id),
            )
            .unwrap();
        assert_eq!(fixit.failed_command_id.as_ref(), Some(&failed.id));
        assert_eq!(queue.pending_fixits().unwrap(), 1);

        // Main progress is held during recovery; fixits are held outside it.
        let in_recovery = queue
            .next_eligible(RunLifecycle::AwaitingRecovery)
            .unwrap()
            .unwrap();
        assert_eq!(message(&in_recovery), "fix");
        assert_eq!(
            message(&queue.next_eligible(RunLifecycle::Running).unwrap().unwrap()),
            "m2"
        );

        queue.mark_running(&fixit.id).unwrap();
        assert_eq!(queue.pending_fixits().unwrap(), 1);
        queue
            .mark_terminal(&fixit.id, CommandOutcome::Succeeded(CommandResult::Empty))
            .unwrap();
        assert_eq!(queue.pending_fixits().unwrap(), 0);
        assert!(queue
            .next_eligible(RunLifecycle::AwaitingRecovery)
            .unwrap()
            .is_none());

        assert_eq!(message(&run_next(&queue)), "m2");
    }

    #[test]
    fn test_lane_rules() {
        let queue = CommandQueue::new();

        let err = queue
            .enqueue(CommandRequest::fixit(comment("x")), RunLifecycle::Running, None)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidLaneTransition { .. }));

        let err = queue
            .enqueue(CommandRequest::setup(comment("x")), RunLifecycle::Paused, None)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidLaneTransition { .. }));

        let err = queue
            .enqueue(CommandRequest::protocol(comment("x")), RunLifecycle::Finished, None)
            .unwrap_err();
        assert!(matches!(err, QueueError::RunTerminal(RunLifecycle::Finished)));

        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_invalid_params_rejected_at_enqueue() {
        let queue = CommandQueue::new();
        let params = CommandParams::Aspirate(LiquidHandlingParams {
            target: WellTarget::new("p1", "plate", "A1"),
            volume: -1.0,
            flow_rate: None,
        });
        let err = queue
            .enqueue(CommandRequest::protocol(params), RunLifecycle::Ready, None)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidParams(_)));
    }

    #[test]
    fn test_status_transitions_are_enforced() {
        let queue = CommandQueue::new();
        let a = queue
            .enqueue(CommandRequest::protocol(comment("a")), RunLifecycle::Ready, None)
            .unwrap();
        let b = queue
            .enqueue(CommandRequest::protocol(comment("b")), RunLifecycle::Ready, None)
            .unwrap();

        let err = queue
            .mark_terminal(&a.id, CommandOutcome::Succeeded(CommandResult::Empty))
            .unwrap_err();
        assert!(matches!(err, QueueError::CommandNotRunning { .. }));

        queue.mark_running(&a.id).unwrap();
        let err = queue.mark_running(&a.id).unwrap_err();
        assert!(matches!(err, QueueError::CommandNotQueued { .. }));

        let err = queue.mark_running(&b.id).unwrap_err();
        assert!(matches!(err, QueueError::AnotherCommandRunning { .. }));

        queue
            .mark_terminal(&a.id, CommandOutcome::Succeeded(CommandResult::Empty))
            .unwrap();
        let err = queue
            .mark_terminal(&a.id, CommandOutcome::Succeeded(CommandResult::Empty))
            .unwrap_err();
        assert!(matches!(err, QueueError::CommandNotRunning { .. }));
        assert_eq!(queue.get(&a.id).unwrap().status, CommandStatus::Succeeded);

        let err = queue.mark_running(&CommandId::from("cmd-missing")).unwrap_err();
        assert!(matches!(err, QueueError::CommandNotFound(_)));
    }

    #[test]
    fn test_keyed_enqueue_is_idempotent() {
        let queue = CommandQueue::new();
        let first = queue
            .enqueue(
                CommandRequest::protocol(comment("a")).with_key("step-1"),
                RunLifecycle::Ready,
                None,
            )
            .unwrap();
        let again = queue
            .enqueue(
                CommandRequest::protocol(comment("a")).with_key("step-1"),
                RunLifecycle::Ready,
                None,
            )
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(queue.len().unwrap(), 1);

        let err = queue
            .enqueue(
                CommandRequest::protocol(comment("different")).with_key("step-1"),
                RunLifecycle::Ready,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateKey(_)));
        assert_eq!(queue.get_by_key("step-1").unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_list_slice_and_current() {
        let queue = CommandQueue::new();
        queue
            .enqueue(
                CommandRequest::setup(CommandParams::Home(HomeParams::default())),
                RunLifecycle::Ready,
                None,
            )
            .unwrap();
        for m in ["a", "b", "c"] {
            queue
                .enqueue(CommandRequest::protocol(comment(m)), RunLifecycle::Ready, None)
                .unwrap();
        }
        assert!(queue.current().unwrap().is_none());

        run_next(&queue);
        let second = run_next(&queue);

        let current = queue.current().unwrap().unwrap();
        assert_eq!(current.command_id, second.id);
        assert_eq!(current.index, 1);

        let window = queue.slice(None, 10).unwrap();
        assert_eq!(window.cursor, 0);
        assert_eq!(window.commands.len(), 2);
        assert_eq!(window.total_length, 4);

        let tail = queue.slice(Some(3), 10).unwrap();
        assert_eq!(tail.commands.len(), 1);

        let queued = queue
            .list(&CommandFilter::new().with_status(CommandStatus::Queued))
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queue.lane_len(CommandIntent::Protocol).unwrap(), 2);
        assert_eq!(queue.lane_len(CommandIntent::Setup).unwrap(), 0);
    }

    #[test]
    fn test_from_history_fails_interrupted_command() {
        let queue = CommandQueue::new();
        let a = queue
            .enqueue(CommandRequest::protocol(comment("a")), RunLifecycle::Ready, None)
            .unwrap();
        queue
            .enqueue(CommandRequest::protocol(comment("b")), RunLifecycle::Ready, None)
            .unwrap();
        queue.mark_running(&a.id).unwrap();

        let history = queue.list(&CommandFilter::new()).unwrap();
        let restored = CommandQueue::from_history(history);

        let a = restored.get(&a.id).unwrap();
        assert_eq!(a.status, CommandStatus::Failed);
        assert!(restored.running_id().unwrap().is_none());
        assert_eq!(
            message(&restored.next_eligible(RunLifecycle::Running).unwrap().unwrap()),
            "b"
        );
    }
}
