//! Point-in-time view of every sub-state.

use chrono::{DateTime, Utc};
use protocol_models::{LabwareId, PipetteId, StateChange};
use serde::Serialize;

use crate::errors::ErrorLog;
use crate::labware::LabwareStates;
use crate::liquids::LiquidStates;
use crate::modules::ModuleStates;
use crate::motion::MotionState;
use crate::pipettes::PipetteStates;

/// Immutable once handed out; the store swaps in a new one per apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub pipettes: PipetteStates,
    pub labware: LabwareStates,
    pub modules: ModuleStates,
    pub liquids: LiquidStates,
    pub motion: MotionState,
    pub errors: ErrorLog,
    /// Sequence number of the last delta folded into this snapshot.
    pub sequence: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub(crate) fn apply_change(&mut self, change: &StateChange, at: DateTime<Utc>) {
        self.pipettes.apply(change);
        self.labware.apply(change);
        self.modules.apply(change);
        self.liquids.apply(change);
        self.motion.apply(change);
        self.errors.apply(change, at);
    }

    pub fn tip_attached(&self, pipette_id: &PipetteId) -> bool {
        self.pipettes
            .get(pipette_id)
            .map_or(false, |p| p.has_tip())
    }

    pub fn aspirated_volume(&self, pipette_id: &PipetteId) -> Option<f64> {
        self.pipettes.get(pipette_id).map(|p| p.aspirated_volume)
    }

    pub fn well_volume(&self, labware_id: &LabwareId, well_name: &str) -> Option<f64> {
        self.liquids.well_volume(labware_id, well_name)
    }

    pub fn tips_remaining(&self, labware_id: &LabwareId) -> Option<usize> {
        self.labware.get(labware_id).map(|l| l.tips_remaining())
    }
}
