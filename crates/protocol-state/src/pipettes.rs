//! Pipette sub-state: what is loaded, tips, and held liquid.

use std::collections::BTreeMap;

use protocol_models::{Mount, PipetteId, PipetteLocation, StateChange};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipetteState {
    pub pipette_id: PipetteId,
    pub pipette_name: String,
    pub mount: Mount,
    pub max_volume: f64,
    /// Volume of the attached tip, `None` when bare.
    pub tip_volume: Option<f64>,
    /// Liquid currently held, in µL.
    pub aspirated_volume: f64,
    pub location: Option<PipetteLocation>,
}

impl PipetteState {
    pub fn has_tip(&self) -> bool {
        self.tip_volume.is_some()
    }

    /// Most liquid the pipette can hold right now.
    pub fn working_volume(&self) -> f64 {
        match self.tip_volume {
            Some(tip) => tip.min(self.max_volume),
            None => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipetteStates {
    pub by_id: BTreeMap<PipetteId, PipetteState>,
}

impl PipetteStates {
    pub fn get(&self, id: &PipetteId) -> Option<&PipetteState> {
        self.by_id.get(id)
    }

    pub fn on_mount(&self, mount: Mount) -> Option<&PipetteState> {
        self.by_id.values().find(|p| p.mount == mount)
    }

    pub(crate) fn apply(&mut self, change: &StateChange) {
        match change {
            StateChange::PipetteLoaded {
                pipette_id,
                pipette_name,
                mount,
                max_volume,
            } => {
                self.by_id.insert(
                    pipette_id.clone(),
                    PipetteState {
                        pipette_id: pipette_id.clone(),
                        pipette_name: pipette_name.clone(),
                        mount: *mount,
                        max_volume: *max_volume,
                        tip_volume: None,
                        aspirated_volume: 0.0,
                        location: None,
                    },
                );
            }
            StateChange::TipAttached {
                pipette_id,
                tip_volume,
            } => {
                if let Some(p) = self.by_id.get_mut(pipette_id) {
                    p.tip_volume = Some(*tip_volume);
                }
            }
            StateChange::TipDetached { pipette_id } => {
                if let Some(p) = self.by_id.get_mut(pipette_id) {
                    p.tip_volume = None;
                }
            }
            StateChange::PipetteVolumeSet { pipette_id, volume } => {
                if let Some(p) = self.by_id.get_mut(pipette_id) {
                    p.aspirated_volume = *volume;
                }
            }
            StateChange::PipetteMoved {
                pipette_id,
                location,
            } => {
                for p in self.by_id.values_mut() {
                    p.location = if &p.pipette_id == pipette_id {
                        Some(location.clone())
                    } else {
                        None
                    };
                }
            }
            StateChange::Homed { .. } | StateChange::PositionLost => {
                for p in self.by_id.values_mut() {
                    p.location = None;
                }
            }
            _ => {}
        }
    }
}
