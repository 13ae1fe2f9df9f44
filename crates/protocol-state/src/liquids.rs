//! Liquid sub-state: loaded liquids and known well volumes.

use std::collections::BTreeMap;

use protocol_models::{LabwareId, LiquidId, StateChange};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidStates {
    /// Labware each liquid was loaded into.
    pub liquids: BTreeMap<LiquidId, LabwareId>,
    /// Known well volumes in µL. A missing well means "unknown".
    pub volumes: BTreeMap<LabwareId, BTreeMap<String, f64>>,
}

impl LiquidStates {
    pub fn well_volume(&self, labware_id: &LabwareId, well_name: &str) -> Option<f64> {
        self.volumes
            .get(labware_id)
            .and_then(|wells| wells.get(well_name))
            .copied()
    }

    pub(crate) fn apply(&mut self, change: &StateChange) {
        match change {
            StateChange::LiquidLoaded {
                liquid_id,
                labware_id,
                volume_by_well,
            } => {
                self.liquids.insert(liquid_id.clone(), labware_id.clone());
                let wells = self.volumes.entry(labware_id.clone()).or_default();
                for (well, volume) in volume_by_well {
                    wells.insert(well.clone(), *volume);
                }
            }
            StateChange::WellVolumeSet {
                labware_id,
                well_name,
                volume,
            } => match volume {
                Some(v) => {
                    self.volumes
                        .entry(labware_id.clone())
                        .or_default()
                        .insert(well_name.clone(), *v);
                }
                None => {
                    if let Some(wells) = self.volumes.get_mut(labware_id) {
                        wells.remove(well_name);
                    }
                }
            },
            _ => {}
        }
    }
}
