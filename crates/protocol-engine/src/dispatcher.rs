//! The seam between the engine and the hardware.
//!
//! The engine calls [`HardwareDispatcher::execute`] exactly once per
//! hardware command, never for two commands at the same time. What sits on
//! the far side (motion control, firmware, a simulator) is not the engine's
//! business.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use protocol_models::{
    Command, CommandError, CommandId, CommandOutcome, CommandParams, CommandResult, DefinedError,
};
use protocol_state::StateSnapshot;
use thiserror::Error;
use tracing::debug;

/// How a hardware call failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// A classified failure the recovery policy can reason about.
    #[error("{0}")]
    Defined(DefinedError),
    /// Anything else. Always fails the run.
    #[error("{0}")]
    Undefined(String),
}

impl From<DefinedError> for DispatchError {
    fn from(error: DefinedError) -> Self {
        DispatchError::Defined(error)
    }
}

impl DispatchError {
    pub fn into_outcome(self) -> CommandOutcome {
        match self {
            DispatchError::Defined(e) => CommandOutcome::Failed(CommandError::Defined(e)),
            DispatchError::Undefined(detail) => {
                CommandOutcome::Failed(CommandError::undefined(detail))
            }
        }
    }
}

/// Executes hardware commands.
///
/// `state` is the snapshot as of the previous command's completion. A call
/// may take as long as the hardware needs (temperature waits run for
/// minutes); pause and stop requests wait for it to return. Cancelling the
/// physical action, or timing it out, is up to the implementation.
///
/// # Example
///
/// ```ignore
/// use protocol_engine::{DispatchError, HardwareDispatcher};
///
/// struct Robot { /* ... */ }
///
/// #[async_trait::async_trait]
/// impl HardwareDispatcher for Robot {
///     async fn execute(&self, command: &Command, state: &StateSnapshot)
///         -> Result<CommandResult, DispatchError>
///     {
///         self.send_to_firmware(&command.params).await
///     }
/// }
/// ```
#[async_trait]
pub trait HardwareDispatcher: Send + Sync {
    async fn execute(
        &self,
        command: &Command,
        state: &StateSnapshot,
    ) -> Result<CommandResult, DispatchError>;
}

/// Dispatcher that pretends every command worked.
///
/// Results are derived from the params and the current state. Failures can
/// be injected per command key; each injected failure fires once.
#[derive(Debug, Default)]
pub struct SimulatingDispatcher {
    delay: Option<Duration>,
    failures: Mutex<HashMap<String, DefinedError>>,
    calls: Mutex<Vec<CommandId>>,
}

impl SimulatingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes the command enqueued with `key` fail with `error`.
    pub fn with_failure(self, key: impl Into<String>, error: DefinedError) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(key.into(), error);
        }
        self
    }

    /// IDs of every command executed so far, in call order.
    pub fn calls(&self) -> Vec<CommandId> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn simulate(command: &Command, state: &StateSnapshot) -> CommandResult {
        match &command.params {
            CommandParams::MoveToCoordinates(p) => CommandResult::Moved {
                position: p.coordinates,
            },
            CommandParams::PickUpTip(t) => state
                .labware
                .get(&t.labware_id)
                .and_then(|l| l.tip_volume)
                .map(|tip_volume| CommandResult::TipPickedUp { tip_volume })
                .unwrap_or_default(),
            CommandParams::Aspirate(p) => CommandResult::Aspirated { volume: p.volume },
            CommandParams::Dispense(p) => {
                let held = state.aspirated_volume(&p.target.pipette_id).unwrap_or(0.0);
                CommandResult::Dispensed {
                    volume: p.volume.min(held),
                }
            }
            CommandParams::WaitForTemperature(p) => p
                .celsius
                .or_else(|| {
                    state
                        .modules
                        .get(&p.module_id)
                        .and_then(|m| m.target_celsius())
                })
                .map(|celsius| CommandResult::TemperatureReached { celsius })
                .unwrap_or_default(),
            _ => CommandResult::Empty,
        }
    }
}

#[async_trait]
impl HardwareDispatcher for SimulatingDispatcher {
    async fn execute(
        &self,
        command: &Command,
        state: &StateSnapshot,
    ) -> Result<CommandResult, DispatchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.calls
            .lock()
            .map_err(|e| DispatchError::Undefined(e.to_string()))?
            .push(command.id.clone());

        let injected = self
            .failures
            .lock()
            .map_err(|e| DispatchError::Undefined(e.to_string()))?
            .remove(&command.key);
        if let Some(error) = injected {
            debug!(command_id = %command.id, error_type = %error.error_type, "injecting failure");
            return Err(DispatchError::Defined(error));
        }

        Ok(Self::simulate(command, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_models::{
        CommandRequest, ErrorType, LiquidHandlingParams, MoveToCoordinatesParams, Point,
        WellTarget,
    };

    fn command(params: CommandParams) -> Command {
        Command::from_request(CommandRequest::protocol(params).with_key("step-1"))
    }

    #[tokio::test]
    async fn test_simulated_results_follow_params() {
        let dispatcher = SimulatingDispatcher::new();
        let state = StateSnapshot::default();

        let moved = command(CommandParams::MoveToCoordinates(MoveToCoordinatesParams {
            pipette_id: "p1".into(),
            coordinates: Point::new(1.0, 2.0, 3.0),
        }));
        let result = dispatcher.execute(&moved, &state).await.unwrap();
        assert_eq!(
            result,
            CommandResult::Moved {
                position: Point::new(1.0, 2.0, 3.0)
            }
        );

        let aspirate = command(CommandParams::Aspirate(LiquidHandlingParams {
            target: WellTarget::new("p1", "plate", "A1"),
            volume: 20.0,
            flow_rate: None,
        }));
        let result = dispatcher.execute(&aspirate, &state).await.unwrap();
        assert_eq!(result.volume(), Some(20.0));
        assert_eq!(dispatcher.calls(), vec![moved.id, aspirate.id]);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let dispatcher = SimulatingDispatcher::new().with_failure(
            "step-1",
            DefinedError::new(ErrorType::TipNotDetected, "simulated"),
        );
        let state = StateSnapshot::default();
        let cmd = command(CommandParams::PickUpTip(WellTarget::new("p1", "tips", "A1")));

        let err = dispatcher.execute(&cmd, &state).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Defined(DefinedError {
                error_type: ErrorType::TipNotDetected,
                ..
            })
        ));
        assert!(dispatcher.execute(&cmd, &state).await.is_ok());
    }

    #[test]
    fn test_into_outcome() {
        let outcome = DispatchError::Undefined("boom".into()).into_outcome();
        match outcome {
            CommandOutcome::Failed(error) => assert!(error.as_defined().is_none()),
            CommandOutcome::Succeeded(_) => panic!("expected failure"),
        }
    }
}
