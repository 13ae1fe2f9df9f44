//! Module sub-state: temperature and magnetic modules.

use std::collections::BTreeMap;

use protocol_models::{ModuleId, ModuleModel, StateChange};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ModuleData {
    #[serde(rename_all = "camelCase")]
    Temperature {
        target_celsius: Option<f64>,
        reached_celsius: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Magnetic { engaged_height: Option<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleState {
    pub module_id: ModuleId,
    pub model: ModuleModel,
    pub location: String,
    pub data: ModuleData,
}

impl ModuleState {
    pub fn target_celsius(&self) -> Option<f64> {
        match self.data {
            ModuleData::Temperature { target_celsius, .. } => target_celsius,
            ModuleData::Magnetic { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModuleStates {
    pub by_id: BTreeMap<ModuleId, ModuleState>,
}

impl ModuleStates {
    pub fn get(&self, id: &ModuleId) -> Option<&ModuleState> {
        self.by_id.get(id)
    }

    pub(crate) fn apply(&mut self, change: &StateChange) {
        match change {
            StateChange::ModuleLoaded {
                module_id,
                model,
                location,
            } => {
                let data = match model {
                    ModuleModel::TemperatureModule => ModuleData::Temperature {
                        target_celsius: None,
                        reached_celsius: None,
                    },
                    ModuleModel::MagneticModule => ModuleData::Magnetic {
                        engaged_height: None,
                    },
                };
                self.by_id.insert(
                    module_id.clone(),
                    ModuleState {
                        module_id: module_id.clone(),
                        model: *model,
                        location: location.clone(),
                        data,
                    },
                );
            }
            StateChange::TemperatureTargetSet { module_id, celsius } => {
                if let Some(ModuleData::Temperature {
                    target_celsius,
                    reached_celsius,
                }) = self.by_id.get_mut(module_id).map(|m| &mut m.data)
                {
                    *target_celsius = *celsius;
                    if celsius.is_none() {
                        *reached_celsius = None;
                    }
                }
            }
            StateChange::TemperatureReached { module_id, celsius } => {
                if let Some(ModuleData::Temperature {
                    reached_celsius, ..
                }) = self.by_id.get_mut(module_id).map(|m| &mut m.data)
                {
                    *reached_celsius = Some(*celsius);
                }
            }
            StateChange::MagnetSet { module_id, height } => {
                if let Some(ModuleData::Magnetic { engaged_height }) =
                    self.by_id.get_mut(module_id).map(|m| &mut m.data)
                {
                    *engaged_height = *height;
                }
            }
            _ => {}
        }
    }
}
