//! Aggregated robot state for the protocol execution engine.
//!
//! [`StateStore::apply`] is the only way state changes. It folds a
//! terminal command into six sub-states:
//! - pipettes: loaded pipettes, attached tips, held volume
//! - labware: placement, wells, tip availability
//! - modules: temperature and magnetic module targets
//! - liquids: known well volumes
//! - motion: homing and gantry position
//! - errors: every recorded command failure
//!
//! Readers take an `Arc<StateSnapshot>` from [`StateStore::snapshot`].

pub mod error;
pub mod errors;
pub mod labware;
pub mod liquids;
pub mod modules;
pub mod motion;
pub mod pipettes;
mod planner;
pub mod snapshot;
pub mod store;

pub use error::{Result, StateError};
pub use errors::{ErrorEntry, ErrorLog};
pub use labware::{LabwareState, LabwareStates};
pub use liquids::LiquidStates;
pub use modules::{ModuleData, ModuleState, ModuleStates};
pub use motion::MotionState;
pub use pipettes::{PipetteState, PipetteStates};
pub use snapshot::StateSnapshot;
pub use store::{Applied, StateStore};
