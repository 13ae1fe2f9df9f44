//! Labware sub-state: placement, wells and tip availability.

use std::collections::BTreeMap;

use protocol_models::{LabwareId, LabwareLocation, StateChange};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabwareState {
    pub labware_id: LabwareId,
    pub load_name: String,
    pub location: LabwareLocation,
    pub wells: Vec<String>,
    pub tip_volume: Option<f64>,
    pub well_capacity: Option<f64>,
    /// Tip racks only: whether each well still holds an unused tip.
    pub tips: BTreeMap<String, bool>,
}

impl LabwareState {
    pub fn is_tip_rack(&self) -> bool {
        self.tip_volume.is_some()
    }

    pub fn has_well(&self, well_name: &str) -> bool {
        self.wells.iter().any(|w| w == well_name)
    }

    pub fn has_tip(&self, well_name: &str) -> bool {
        self.tips.get(well_name).copied().unwrap_or(false)
    }

    pub fn tips_remaining(&self) -> usize {
        self.tips.values().filter(|present| **present).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabwareStates {
    pub by_id: BTreeMap<LabwareId, LabwareState>,
}

impl LabwareStates {
    pub fn get(&self, id: &LabwareId) -> Option<&LabwareState> {
        self.by_id.get(id)
    }

    /// Labware sitting in a deck slot, if any.
    pub fn in_slot(&self, slot: &str) -> Option<&LabwareState> {
        self.by_id
            .values()
            .find(|l| matches!(&l.location, LabwareLocation::Slot(s) if s == slot))
    }

    pub(crate) fn apply(&mut self, change: &StateChange) {
        match change {
            StateChange::LabwareLoaded {
                labware_id,
                load_name,
                location,
                wells,
                tip_volume,
                well_capacity,
            } => {
                let tips = if tip_volume.is_some() {
                    wells.iter().map(|w| (w.clone(), true)).collect()
                } else {
                    BTreeMap::new()
                };
                self.by_id.insert(
                    labware_id.clone(),
                    LabwareState {
                        labware_id: labware_id.clone(),
                        load_name: load_name.clone(),
                        location: location.clone(),
                        wells: wells.clone(),
                        tip_volume: *tip_volume,
                        well_capacity: *well_capacity,
                        tips,
                    },
                );
            }
            StateChange::TipConsumed {
                labware_id,
                well_name,
            } => {
                if let Some(tip) = self
                    .by_id
                    .get_mut(labware_id)
                    .and_then(|l| l.tips.get_mut(well_name))
                {
                    *tip = false;
                }
            }
            _ => {}
        }
    }
}
