//! Gantry motion sub-state.

use protocol_models::{MotorAxis, PipetteId, StateChange};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionState {
    /// False until the first home, and again after position is lost.
    pub homed: bool,
    pub last_homed_axes: Option<Vec<MotorAxis>>,
    /// Pipette that moved last; the gantry is wherever it is.
    pub active_pipette: Option<PipetteId>,
}

impl MotionState {
    pub(crate) fn apply(&mut self, change: &StateChange) {
        match change {
            StateChange::Homed { axes } => {
                self.homed = true;
                self.last_homed_axes = axes.clone();
                self.active_pipette = None;
            }
            StateChange::PositionLost => {
                self.homed = false;
                self.active_pipette = None;
            }
            StateChange::PipetteMoved { pipette_id, .. } => {
                self.active_pipette = Some(pipette_id.clone());
            }
            _ => {}
        }
    }
}
