//! Command parameters: one closed enum, one variant per command kind.
//!
//! `CommandParams` is the dispatch table's key. Every kind has exactly one
//! validation rule set here, one execution path (hardware or engine-internal)
//! and one state-apply arm in the state store, and the compiler checks that
//! each match stays exhaustive.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deck::{LabwareLocation, ModuleModel, Mount, MotorAxis, Point};
use crate::ids::{LabwareId, LiquidId, ModuleId, PipetteId};

/// Lowest temperature a temperature module accepts, in °C.
pub const MIN_MODULE_CELSIUS: f64 = 4.0;
/// Highest temperature a temperature module accepts, in °C.
pub const MAX_MODULE_CELSIUS: f64 = 95.0;

/// Rejected command parameters.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid params for {command_type}: {reason}")]
pub struct InvalidParams {
    pub command_type: CommandType,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeParams {
    /// Axes to home. `None` homes everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axes: Option<Vec<MotorAxis>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPipetteParams {
    pub pipette_id: PipetteId,
    pub pipette_name: String,
    pub mount: Mount,
    /// Working volume in µL.
    pub max_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadLabwareParams {
    pub labware_id: LabwareId,
    pub load_name: String,
    pub location: LabwareLocation,
    pub wells: Vec<String>,
    /// Set for tip racks; every well starts with one tip of this volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub well_capacity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModuleParams {
    pub module_id: ModuleId,
    pub model: ModuleModel,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadLiquidParams {
    pub liquid_id: LiquidId,
    pub labware_id: LabwareId,
    pub volume_by_well: BTreeMap<String, f64>,
}

/// Shared shape of commands that target one well with one pipette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellTarget {
    pub pipette_id: PipetteId,
    pub labware_id: LabwareId,
    pub well_name: String,
}

impl WellTarget {
    pub fn new(
        pipette_id: impl Into<PipetteId>,
        labware_id: impl Into<LabwareId>,
        well_name: impl Into<String>,
    ) -> Self {
        Self {
            pipette_id: pipette_id.into(),
            labware_id: labware_id.into(),
            well_name: well_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToCoordinatesParams {
    pub pipette_id: PipetteId,
    pub coordinates: Point,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidHandlingParams {
    #[serde(flatten)]
    pub target: WellTarget,
    /// Volume in µL.
    pub volume: f64,
    /// µL/s; the dispatcher picks a default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropTipParams {
    pub pipette_id: PipetteId,
    /// Drop location. `None` means the fixed trash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labware_id: Option<LabwareId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub well_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTarget {
    pub module_id: ModuleId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTargetTemperatureParams {
    pub module_id: ModuleId,
    pub celsius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForTemperatureParams {
    pub module_id: ModuleId,
    /// Defaults to the module's current target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub celsius: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngageMagnetParams {
    pub module_id: ModuleId,
    /// Height above labware bottom, in mm.
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForResumeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForDurationParams {
    pub seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentParams {
    pub message: String,
}

/// Parameters of a command, tagged by `commandType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commandType", content = "params")]
pub enum CommandParams {
    #[serde(rename = "home")]
    Home(HomeParams),
    #[serde(rename = "loadPipette")]
    LoadPipette(LoadPipetteParams),
    #[serde(rename = "loadLabware")]
    LoadLabware(LoadLabwareParams),
    #[serde(rename = "loadModule")]
    LoadModule(LoadModuleParams),
    #[serde(rename = "loadLiquid")]
    LoadLiquid(LoadLiquidParams),
    #[serde(rename = "moveToWell")]
    MoveToWell(WellTarget),
    #[serde(rename = "moveToCoordinates")]
    MoveToCoordinates(MoveToCoordinatesParams),
    #[serde(rename = "pickUpTip")]
    PickUpTip(WellTarget),
    #[serde(rename = "aspirate")]
    Aspirate(LiquidHandlingParams),
    #[serde(rename = "dispense")]
    Dispense(LiquidHandlingParams),
    #[serde(rename = "blowOut")]
    BlowOut(WellTarget),
    #[serde(rename = "dropTip")]
    DropTip(DropTipParams),
    #[serde(rename = "temperatureModule/setTargetTemperature")]
    SetTargetTemperature(SetTargetTemperatureParams),
    #[serde(rename = "temperatureModule/waitForTemperature")]
    WaitForTemperature(WaitForTemperatureParams),
    #[serde(rename = "temperatureModule/deactivate")]
    DeactivateTemperature(ModuleTarget),
    #[serde(rename = "magneticModule/engage")]
    EngageMagnet(EngageMagnetParams),
    #[serde(rename = "magneticModule/disengage")]
    DisengageMagnet(ModuleTarget),
    #[serde(rename = "waitForResume")]
    WaitForResume(WaitForResumeParams),
    #[serde(rename = "waitForDuration")]
    WaitForDuration(WaitForDurationParams),
    #[serde(rename = "comment")]
    Comment(CommentParams),
}

/// Field-less mirror of [`CommandParams`], used as the rule key in
/// recovery policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    #[serde(rename = "home")]
    Home,
    #[serde(rename = "loadPipette")]
    LoadPipette,
    #[serde(rename = "loadLabware")]
    LoadLabware,
    #[serde(rename = "loadModule")]
    LoadModule,
    #[serde(rename = "loadLiquid")]
    LoadLiquid,
    #[serde(rename = "moveToWell")]
    MoveToWell,
    #[serde(rename = "moveToCoordinates")]
    MoveToCoordinates,
    #[serde(rename = "pickUpTip")]
    PickUpTip,
    #[serde(rename = "aspirate")]
    Aspirate,
    #[serde(rename = "dispense")]
    Dispense,
    #[serde(rename = "blowOut")]
    BlowOut,
    #[serde(rename = "dropTip")]
    DropTip,
    #[serde(rename = "temperatureModule/setTargetTemperature")]
    SetTargetTemperature,
    #[serde(rename = "temperatureModule/waitForTemperature")]
    WaitForTemperature,
    #[serde(rename = "temperatureModule/deactivate")]
    DeactivateTemperature,
    #[serde(rename = "magneticModule/engage")]
    EngageMagnet,
    #[serde(rename = "magneticModule/disengage")]
    DisengageMagnet,
    #[serde(rename = "waitForResume")]
    WaitForResume,
    #[serde(rename = "waitForDuration")]
    WaitForDuration,
    #[serde(rename = "comment")]
    Comment,
}

impl CommandType {
    pub const ALL: [CommandType; 20] = [
        CommandType::Home,
        CommandType::LoadPipette,
        CommandType::LoadLabware,
        CommandType::LoadModule,
        CommandType::LoadLiquid,
        CommandType::MoveToWell,
        CommandType::MoveToCoordinates,
        CommandType::PickUpTip,
        CommandType::Aspirate,
        CommandType::Dispense,
        CommandType::BlowOut,
        CommandType::DropTip,
        CommandType::SetTargetTemperature,
        CommandType::WaitForTemperature,
        CommandType::DeactivateTemperature,
        CommandType::EngageMagnet,
        CommandType::DisengageMagnet,
        CommandType::WaitForResume,
        CommandType::WaitForDuration,
        CommandType::Comment,
    ];

    /// Wire name, e.g. `"pickUpTip"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Home => "home",
            CommandType::LoadPipette => "loadPipette",
            CommandType::LoadLabware => "loadLabware",
            CommandType::LoadModule => "loadModule",
            CommandType::LoadLiquid => "loadLiquid",
            CommandType::MoveToWell => "moveToWell",
            CommandType::MoveToCoordinates => "moveToCoordinates",
            CommandType::PickUpTip => "pickUpTip",
            CommandType::Aspirate => "aspirate",
            CommandType::Dispense => "dispense",
            CommandType::BlowOut => "blowOut",
            CommandType::DropTip => "dropTip",
            CommandType::SetTargetTemperature => "temperatureModule/setTargetTemperature",
            CommandType::WaitForTemperature => "temperatureModule/waitForTemperature",
            CommandType::DeactivateTemperature => "temperatureModule/deactivate",
            CommandType::EngageMagnet => "magneticModule/engage",
            CommandType::DisengageMagnet => "magneticModule/disengage",
            CommandType::WaitForResume => "waitForResume",
            CommandType::WaitForDuration => "waitForDuration",
            CommandType::Comment => "comment",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown command type: {}", s))
    }
}

/// How the engine carries out a command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Sent to the hardware dispatcher.
    Hardware,
    /// Handled by the executor itself without touching hardware.
    Internal,
}

impl CommandParams {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandParams::Home(_) => CommandType::Home,
            CommandParams::LoadPipette(_) => CommandType::LoadPipette,
            CommandParams::LoadLabware(_) => CommandType::LoadLabware,
            CommandParams::LoadModule(_) => CommandType::LoadModule,
            CommandParams::LoadLiquid(_) => CommandType::LoadLiquid,
            CommandParams::MoveToWell(_) => CommandType::MoveToWell,
            CommandParams::MoveToCoordinates(_) => CommandType::MoveToCoordinates,
            CommandParams::PickUpTip(_) => CommandType::PickUpTip,
            CommandParams::Aspirate(_) => CommandType::Aspirate,
            CommandParams::Dispense(_) => CommandType::Dispense,
            CommandParams::BlowOut(_) => CommandType::BlowOut,
            CommandParams::DropTip(_) => CommandType::DropTip,
            CommandParams::SetTargetTemperature(_) => CommandType::SetTargetTemperature,
            CommandParams::WaitForTemperature(_) => CommandType::WaitForTemperature,
            CommandParams::DeactivateTemperature(_) => CommandType::DeactivateTemperature,
            CommandParams::EngageMagnet(_) => CommandType::EngageMagnet,
            CommandParams::DisengageMagnet(_) => CommandType::DisengageMagnet,
            CommandParams::WaitForResume(_) => CommandType::WaitForResume,
            CommandParams::WaitForDuration(_) => CommandType::WaitForDuration,
            CommandParams::Comment(_) => CommandType::Comment,
        }
    }

    pub fn execution(&self) -> Execution {
        match self {
            CommandParams::WaitForResume(_)
            | CommandParams::WaitForDuration(_)
            | CommandParams::Comment(_) => Execution::Internal,
            _ => Execution::Hardware,
        }
    }

    /// Pipette referenced by this command, if any.
    pub fn pipette_id(&self) -> Option<&PipetteId> {
        match self {
            CommandParams::LoadPipette(p) => Some(&p.pipette_id),
            CommandParams::MoveToWell(t)
            | CommandParams::PickUpTip(t)
            | CommandParams::BlowOut(t) => Some(&t.pipette_id),
            CommandParams::MoveToCoordinates(p) => Some(&p.pipette_id),
            CommandParams::Aspirate(p) | CommandParams::Dispense(p) => Some(&p.target.pipette_id),
            CommandParams::DropTip(p) => Some(&p.pipette_id),
            _ => None,
        }
    }

    /// Checks parameter shape. Cross-entity checks (does this pipette
    /// exist?) belong to the state store, not here.
    pub fn validate(&self) -> Result<(), InvalidParams> {
        let command_type = self.command_type();
        let invalid = |reason: &str| InvalidParams {
            command_type,
            reason: reason.to_string(),
        };

        match self {
            CommandParams::Home(_) => Ok(()),
            CommandParams::LoadPipette(p) => {
                if p.pipette_id.is_blank() {
                    return Err(invalid("pipetteId must not be empty"));
                }
                if p.pipette_name.trim().is_empty() {
                    return Err(invalid("pipetteName must not be empty"));
                }
                if !positive(p.max_volume) {
                    return Err(invalid("maxVolume must be a positive number"));
                }
                Ok(())
            }
            CommandParams::LoadLabware(p) => {
                if p.labware_id.is_blank() {
                    return Err(invalid("labwareId must not be empty"));
                }
                if p.load_name.trim().is_empty() {
                    return Err(invalid("loadName must not be empty"));
                }
                if p.wells.is_empty() {
                    return Err(invalid("labware must define at least one well"));
                }
                let mut seen = HashSet::new();
                for well in &p.wells {
                    if well.trim().is_empty() {
                        return Err(invalid("well names must not be empty"));
                    }
                    if !seen.insert(well.as_str()) {
                        return Err(invalid(&format!("duplicate well {}", well)));
                    }
                }
                if let Some(tip_volume) = p.tip_volume {
                    if !positive(tip_volume) {
                        return Err(invalid("tipVolume must be a positive number"));
                    }
                }
                if let Some(capacity) = p.well_capacity {
                    if !positive(capacity) {
                        return Err(invalid("wellCapacity must be a positive number"));
                    }
                }
                Ok(())
            }
            CommandParams::LoadModule(p) => {
                if p.module_id.is_blank() {
                    return Err(invalid("moduleId must not be empty"));
                }
                if p.location.trim().is_empty() {
                    return Err(invalid("location must not be empty"));
                }
                Ok(())
            }
            CommandParams::LoadLiquid(p) => {
                if p.liquid_id.is_blank() || p.labware_id.is_blank() {
                    return Err(invalid("liquidId and labwareId must not be empty"));
                }
                if p.volume_by_well.is_empty() {
                    return Err(invalid("volumeByWell must not be empty"));
                }
                if p.volume_by_well.values().any(|v| !non_negative(*v)) {
                    return Err(invalid("well volumes must be non-negative numbers"));
                }
                Ok(())
            }
            CommandParams::MoveToWell(t) | CommandParams::PickUpTip(t) | CommandParams::BlowOut(t) => {
                check_well_target(t).map_err(|r| invalid(r))
            }
            CommandParams::MoveToCoordinates(p) => {
                if p.pipette_id.is_blank() {
                    return Err(invalid("pipetteId must not be empty"));
                }
                if !p.coordinates.is_finite() {
                    return Err(invalid("coordinates must be finite"));
                }
                Ok(())
            }
            CommandParams::Aspirate(p) | CommandParams::Dispense(p) => {
                check_well_target(&p.target).map_err(|r| invalid(r))?;
                if !positive(p.volume) {
                    return Err(invalid("volume must be a positive number"));
                }
                if let Some(rate) = p.flow_rate {
                    if !positive(rate) {
                        return Err(invalid("flowRate must be a positive number"));
                    }
                }
                Ok(())
            }
            CommandParams::DropTip(p) => {
                if p.pipette_id.is_blank() {
                    return Err(invalid("pipetteId must not be empty"));
                }
                if p.labware_id.is_some() != p.well_name.is_some() {
                    return Err(invalid("labwareId and wellName must be given together"));
                }
                Ok(())
            }
            CommandParams::SetTargetTemperature(p) => {
                check_module(&p.module_id).map_err(|r| invalid(r))?;
                check_celsius(p.celsius).map_err(|r| invalid(&r))
            }
            CommandParams::WaitForTemperature(p) => {
                check_module(&p.module_id).map_err(|r| invalid(r))?;
                match p.celsius {
                    Some(celsius) => check_celsius(celsius).map_err(|r| invalid(&r)),
                    None => Ok(()),
                }
            }
            CommandParams::DeactivateTemperature(t) | CommandParams::DisengageMagnet(t) => {
                check_module(&t.module_id).map_err(|r| invalid(r))
            }
            CommandParams::EngageMagnet(p) => {
                check_module(&p.module_id).map_err(|r| invalid(r))?;
                if !non_negative(p.height) {
                    return Err(invalid("height must be a non-negative number"));
                }
                Ok(())
            }
            CommandParams::WaitForResume(_) | CommandParams::Comment(_) => Ok(()),
            CommandParams::WaitForDuration(p) => {
                if !non_negative(p.seconds) {
                    return Err(invalid("seconds must be a non-negative number"));
                }
                Ok(())
            }
        }
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn check_well_target(target: &WellTarget) -> Result<(), &'static str> {
    if target.pipette_id.is_blank() {
        return Err("pipetteId must not be empty");
    }
    if target.labware_id.is_blank() {
        return Err("labwareId must not be empty");
    }
    if target.well_name.trim().is_empty() {
        return Err("wellName must not be empty");
    }
    Ok(())
}

fn check_module(module_id: &ModuleId) -> Result<(), &'static str> {
    if module_id.is_blank() {
        return Err("moduleId must not be empty");
    }
    Ok(())
}

fn check_celsius(celsius: f64) -> Result<(), String> {
    if !celsius.is_finite() || !(MIN_MODULE_CELSIUS..=MAX_MODULE_CELSIUS).contains(&celsius) {
        return Err(format!(
            "celsius must be between {} and {}",
            MIN_MODULE_CELSIUS, MAX_MODULE_CELSIUS
        ));
    }
    Ok(())
}
