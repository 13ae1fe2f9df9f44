//! Protocol execution engine.
//!
//! Runs a lab protocol as a queue of typed commands against one robot:
//!
//! - [`EngineStore`]: the robot's single run slot (`create_run`,
//!   `get_active_run`, `clear`)
//! - [`RunHandle`]: enqueue commands, `play`/`pause`/`stop`/
//!   `resume_from_recovery`, read status and state snapshots
//! - [`HardwareDispatcher`]: the seam to the hardware
//! - [`RecoveryPolicy`] and [`decide`]: what a failed command does to its run
//!
//! Each run has one executor task. It takes the next eligible command
//! (setup then protocol while running, fixit commands while awaiting
//! recovery), hands it to the dispatcher, folds the outcome into the state
//! store and asks the recovery policy what to do about failures. Pause and
//! stop requests take effect between commands.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use protocol_engine::{EngineConfig, EngineStore, SimulatingDispatcher};
//! use protocol_models::{CommandParams, CommandRequest, HomeParams};
//!
//! # async fn demo() -> protocol_engine::Result<()> {
//! let engine = EngineStore::new(EngineConfig::default(), Arc::new(SimulatingDispatcher::new()));
//! let run = engine.create_run(None).await?;
//! run.enqueue(CommandRequest::protocol(CommandParams::Home(HomeParams::default())))?;
//! run.play()?;
//!
//! let status = run.wait_until_terminal().await;
//! println!("run ended {}", status.lifecycle);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
mod executor;
pub mod policy;
pub mod run;
pub mod store;

pub use config::EngineConfig;
pub use controller::{RunController, RunStatus};
pub use dispatcher::{DispatchError, HardwareDispatcher, SimulatingDispatcher};
pub use error::{ControlAction, EngineError, Result};
pub use policy::{decide, RecoveryPolicy, RecoveryRule};
pub use run::{CommandCounts, RunHandle, RunSnapshot, RunSummary};
pub use store::EngineStore;
