//! Core data types for the protocol execution engine.
//!
//! The queue, state store, engine and CLI all speak in these types:
//!
//! - [`Command`] / [`CommandRequest`]: what gets queued and tracked
//! - [`CommandParams`]: the closed set of command kinds
//! - [`CommandResult`], [`DefinedError`], [`CommandError`]: outcomes
//! - [`RunLifecycle`], [`RunError`]: run-level state
//! - [`StateChange`], [`StateDelta`]: state mutations as values

pub mod command;
pub mod deck;
pub mod ids;
pub mod outcome;
pub mod params;
pub mod run;
pub mod state;

pub use command::{Command, CommandIntent, CommandRequest, CommandStatus};
pub use deck::{LabwareLocation, ModuleModel, Mount, MotorAxis, PipetteLocation, Point};
pub use ids::{CommandId, ErrorId, LabwareId, LiquidId, ModuleId, PipetteId, RunId};
pub use outcome::{CommandError, CommandOutcome, CommandResult, DefinedError, ErrorType};
pub use params::{
    CommandParams, CommandType, CommentParams, DropTipParams, EngageMagnetParams, Execution,
    HomeParams, InvalidParams, LiquidHandlingParams, LoadLabwareParams, LoadLiquidParams,
    LoadModuleParams, LoadPipetteParams, ModuleTarget, MoveToCoordinatesParams,
    SetTargetTemperatureParams, WaitForDurationParams, WaitForResumeParams,
    WaitForTemperatureParams, WellTarget,
};
pub use run::{RecoveryVerdict, RunError, RunErrorKind, RunLifecycle};
pub use state::{StateChange, StateDelta};
