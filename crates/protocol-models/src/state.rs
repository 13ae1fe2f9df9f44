//! State mutations as values.
//!
//! The state store turns each terminal command into a list of
//! [`StateChange`]s before touching anything. Changes carry absolute values
//! (new volume, not "minus 50") so replaying a stored delta twice lands on
//! the same state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deck::{LabwareLocation, ModuleModel, Mount, MotorAxis, PipetteLocation};
use crate::ids::{CommandId, LabwareId, LiquidId, ModuleId, PipetteId};
use crate::outcome::CommandError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "change")]
pub enum StateChange {
    #[serde(rename_all = "camelCase")]
    PipetteLoaded {
        pipette_id: PipetteId,
        pipette_name: String,
        mount: Mount,
        max_volume: f64,
    },
    #[serde(rename_all = "camelCase")]
    LabwareLoaded {
        labware_id: LabwareId,
        load_name: String,
        location: LabwareLocation,
        wells: Vec<String>,
        tip_volume: Option<f64>,
        well_capacity: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    ModuleLoaded {
        module_id: ModuleId,
        model: ModuleModel,
        location: String,
    },
    #[serde(rename_all = "camelCase")]
    LiquidLoaded {
        liquid_id: LiquidId,
        labware_id: LabwareId,
        volume_by_well: BTreeMap<String, f64>,
    },
    Homed {
        axes: Option<Vec<MotorAxis>>,
    },
    /// Gantry position can no longer be trusted, e.g. after a stall.
    PositionLost,
    #[serde(rename_all = "camelCase")]
    PipetteMoved {
        pipette_id: PipetteId,
        location: PipetteLocation,
    },
    #[serde(rename_all = "camelCase")]
    TipAttached {
        pipette_id: PipetteId,
        tip_volume: f64,
    },
    #[serde(rename_all = "camelCase")]
    TipDetached { pipette_id: PipetteId },
    #[serde(rename_all = "camelCase")]
    TipConsumed {
        labware_id: LabwareId,
        well_name: String,
    },
    #[serde(rename_all = "camelCase")]
    PipetteVolumeSet { pipette_id: PipetteId, volume: f64 },
    /// `volume: None` means the well's contents are no longer known.
    #[serde(rename_all = "camelCase")]
    WellVolumeSet {
        labware_id: LabwareId,
        well_name: String,
        volume: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    TemperatureTargetSet {
        module_id: ModuleId,
        celsius: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    TemperatureReached { module_id: ModuleId, celsius: f64 },
    /// `height: None` means disengaged.
    #[serde(rename_all = "camelCase")]
    MagnetSet {
        module_id: ModuleId,
        height: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    ErrorRecorded {
        command_id: CommandId,
        error: CommandError,
    },
}

/// Every change one command produced, in apply order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub command_id: CommandId,
    /// Position of this delta in the run's delta stream, starting at 1.
    pub sequence: u64,
    pub changes: Vec<StateChange>,
    pub recorded_at: DateTime<Utc>,
}

impl StateDelta {
    pub fn new(command_id: CommandId, sequence: u64, changes: Vec<StateChange>) -> Self {
        Self {
            command_id,
            sequence,
            changes,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_tagging() {
        let change = StateChange::TipConsumed {
            labware_id: "tips".into(),
            well_name: "A1".into(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["change"], "tipConsumed");
        assert_eq!(json["labwareId"], "tips");

        let delta = StateDelta::new("cmd-1".into(), 1, vec![change]);
        let text = serde_json::to_string(&delta).unwrap();
        let back: StateDelta = serde_json::from_str(&text).unwrap();
        assert_eq!(back, delta);
    }
}
