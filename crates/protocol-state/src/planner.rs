//! Turns a terminal command into state changes, without mutating anything.
//!
//! Successful commands are checked strictly against current state; a
//! contradiction is an invariant violation. Failed commands only record
//! what the failure is known to have done physically.

use protocol_models::{
    Command, CommandError, CommandId, CommandParams, CommandResult, CommandStatus, DefinedError,
    DropTipParams, ErrorType, LabwareLocation, LiquidHandlingParams, ModuleId, ModuleModel,
    PipetteId, PipetteLocation, StateChange, WellTarget,
};

use crate::error::{Result, StateError};
use crate::labware::LabwareState;
use crate::modules::ModuleState;
use crate::pipettes::PipetteState;
use crate::snapshot::StateSnapshot;

/// Slack for floating point volume comparisons, in µL.
const VOLUME_TOLERANCE: f64 = 1e-6;

pub(crate) fn plan(state: &StateSnapshot, command: &Command) -> Result<Vec<StateChange>> {
    let planner = Planner {
        state,
        command_id: &command.id,
    };
    match command.status {
        CommandStatus::Succeeded => {
            let result = command.result.clone().unwrap_or_default();
            planner.succeeded(&command.params, &result)
        }
        CommandStatus::Failed => match &command.error {
            Some(error) => Ok(planner.failed(&command.params, error)),
            None => Err(StateError::InvariantViolation {
                command_id: command.id.clone(),
                detail: "failed command carries no error".to_string(),
            }),
        },
        CommandStatus::Queued | CommandStatus::Running => {
            Err(StateError::CommandNotTerminal(command.id.clone()))
        }
    }
}

struct Planner<'a> {
    state: &'a StateSnapshot,
    command_id: &'a CommandId,
}

impl<'a> Planner<'a> {
    fn violation(&self, detail: impl Into<String>) -> StateError {
        StateError::InvariantViolation {
            command_id: self.command_id.clone(),
            detail: detail.into(),
        }
    }

    fn pipette(&self, target: &PipetteId) -> Result<&'a PipetteState> {
        self.state
            .pipettes
            .get(target)
            .ok_or_else(|| self.violation(format!("pipette {} is not loaded", target)))
    }

    fn pipette_with_tip(&self, target: &PipetteId) -> Result<&'a PipetteState> {
        let pipette = self.pipette(target)?;
        if !pipette.has_tip() {
            return Err(self.violation(format!("pipette {} has no tip attached", target)));
        }
        Ok(pipette)
    }

    fn well(&self, target: &WellTarget) -> Result<&'a LabwareState> {
        let labware = self
            .state
            .labware
            .get(&target.labware_id)
            .ok_or_else(|| {
                self.violation(format!("labware {} is not loaded", target.labware_id))
            })?;
        if !labware.has_well(&target.well_name) {
            return Err(self.violation(format!(
                "labware {} has no well {}",
                target.labware_id, target.well_name
            )));
        }
        Ok(labware)
    }

    fn module(&self, id: &ModuleId, model: ModuleModel) -> Result<&'a ModuleState> {
        let module = self
            .state
            .modules
            .get(id)
            .ok_or_else(|| self.violation(format!("module {} is not loaded", id)))?;
        if module.model != model {
            return Err(self.violation(format!("module {} is a {:?}", id, module.model)));
        }
        Ok(module)
    }

    fn moved_to(target: &WellTarget) -> StateChange {
        StateChange::PipetteMoved {
            pipette_id: target.pipette_id.clone(),
            location: PipetteLocation::Well {
                labware_id: target.labware_id.clone(),
                well_name: target.well_name.clone(),
            },
        }
    }

    fn succeeded(&self, params: &CommandParams, result: &CommandResult) -> Result<Vec<StateChange>> {
        match params {
            CommandParams::Home(p) => Ok(vec![StateChange::Homed {
                axes: p.axes.clone(),
            }]),
            CommandParams::LoadPipette(p) => {
                if self.state.pipettes.get(&p.pipette_id).is_some() {
                    return Err(self.violation(format!("pipette {} already loaded", p.pipette_id)));
                }
                if let Some(other) = self.state.pipettes.on_mount(p.mount) {
                    return Err(self.violation(format!(
                        "{} mount already holds pipette {}",
                        p.mount, other.pipette_id
                    )));
                }
                Ok(vec![StateChange::PipetteLoaded {
                    pipette_id: p.pipette_id.clone(),
                    pipette_name: p.pipette_name.clone(),
                    mount: p.mount,
                    max_volume: p.max_volume,
                }])
            }
            CommandParams::LoadLabware(p) => {
                if self.state.labware.get(&p.labware_id).is_some() {
                    return Err(self.violation(format!("labware {} already loaded", p.labware_id)));
                }
                match &p.location {
                    LabwareLocation::Slot(slot) => {
                        if let Some(other) = self.state.labware.in_slot(slot) {
                            return Err(self.violation(format!(
                                "slot {} already holds labware {}",
                                slot, other.labware_id
                            )));
                        }
                    }
                    LabwareLocation::Module(module_id) => {
                        if self.state.modules.get(module_id).is_none() {
                            return Err(
                                self.violation(format!("module {} is not loaded", module_id))
                            );
                        }
                    }
                    LabwareLocation::OffDeck => {}
                }
                Ok(vec![StateChange::LabwareLoaded {
                    labware_id: p.labware_id.clone(),
                    load_name: p.load_name.clone(),
                    location: p.location.clone(),
                    wells: p.wells.clone(),
                    tip_volume: p.tip_volume,
                    well_capacity: p.well_capacity,
                }])
            }
            CommandParams::LoadModule(p) => {
                if self.state.modules.get(&p.module_id).is_some() {
                    return Err(self.violation(format!("module {} already loaded", p.module_id)));
                }
                Ok(vec![StateChange::ModuleLoaded {
                    module_id: p.module_id.clone(),
                    model: p.model,
                    location: p.location.clone(),
                }])
            }
            CommandParams::LoadLiquid(p) => {
                let labware = self.state.labware.get(&p.labware_id).ok_or_else(|| {
                    self.violation(format!("labware {} is not loaded", p.labware_id))
                })?;
                for (well, volume) in &p.volume_by_well {
                    if !labware.has_well(well) {
                        return Err(self.violation(format!(
                            "labware {} has no well {}",
                            p.labware_id, well
                        )));
                    }
                    if let Some(capacity) = labware.well_capacity {
                        if *volume > capacity + VOLUME_TOLERANCE {
                            return Err(self.violation(format!(
                                "{} µL exceeds the {} µL capacity of well {}",
                                volume, capacity, well
                            )));
                        }
                    }
                }
                Ok(vec![StateChange::LiquidLoaded {
                    liquid_id: p.liquid_id.clone(),
                    labware_id: p.labware_id.clone(),
                    volume_by_well: p.volume_by_well.clone(),
                }])
            }
            CommandParams::MoveToWell(t) => {
                self.pipette(&t.pipette_id)?;
                self.well(t)?;
                Ok(vec![Self::moved_to(t)])
            }
            CommandParams::MoveToCoordinates(p) => {
                self.pipette(&p.pipette_id)?;
                let point = match result {
                    CommandResult::Moved { position } => *position,
                    _ => p.coordinates,
                };
                Ok(vec![StateChange::PipetteMoved {
                    pipette_id: p.pipette_id.clone(),
                    location: PipetteLocation::Coordinates { point },
                }])
            }
            CommandParams::PickUpTip(t) => self.pick_up_tip(t, result),
            CommandParams::Aspirate(p) => self.aspirate(p, result),
            CommandParams::Dispense(p) => self.dispense(p, result),
            CommandParams::BlowOut(t) => {
                let pipette = self.pipette_with_tip(&t.pipette_id)?;
                self.well(t)?;
                let mut changes = vec![Self::moved_to(t)];
                if let Some(volume) = self.state.well_volume(&t.labware_id, &t.well_name) {
                    changes.push(StateChange::WellVolumeSet {
                        labware_id: t.labware_id.clone(),
                        well_name: t.well_name.clone(),
                        volume: Some(volume + pipette.aspirated_volume),
                    });
                }
                changes.push(StateChange::PipetteVolumeSet {
                    pipette_id: t.pipette_id.clone(),
                    volume: 0.0,
                });
                Ok(changes)
            }
            CommandParams::DropTip(p) => self.drop_tip(p),
            CommandParams::SetTargetTemperature(p) => {
                self.module(&p.module_id, ModuleModel::TemperatureModule)?;
                Ok(vec![StateChange::TemperatureTargetSet {
                    module_id: p.module_id.clone(),
                    celsius: Some(p.celsius),
                }])
            }
            CommandParams::WaitForTemperature(p) => {
                let module = self.module(&p.module_id, ModuleModel::TemperatureModule)?;
                let celsius = match result {
                    CommandResult::TemperatureReached { celsius } => Some(*celsius),
                    _ => p.celsius.or_else(|| module.target_celsius()),
                };
                let celsius = celsius.ok_or_else(|| {
                    self.violation(format!("module {} has no target temperature", p.module_id))
                })?;
                Ok(vec![StateChange::TemperatureReached {
                    module_id: p.module_id.clone(),
                    celsius,
                }])
            }
            CommandParams::DeactivateTemperature(t) => {
                self.module(&t.module_id, ModuleModel::TemperatureModule)?;
                Ok(vec![StateChange::TemperatureTargetSet {
                    module_id: t.module_id.clone(),
                    celsius: None,
                }])
            }
            CommandParams::EngageMagnet(p) => {
                self.module(&p.module_id, ModuleModel::MagneticModule)?;
                Ok(vec![StateChange::MagnetSet {
                    module_id: p.module_id.clone(),
                    height: Some(p.height),
                }])
            }
            CommandParams::DisengageMagnet(t) => {
                self.module(&t.module_id, ModuleModel::MagneticModule)?;
                Ok(vec![StateChange::MagnetSet {
                    module_id: t.module_id.clone(),
                    height: None,
                }])
            }
            CommandParams::WaitForResume(_)
            | CommandParams::WaitForDuration(_)
            | CommandParams::Comment(_) => Ok(Vec::new()),
        }
    }

    fn pick_up_tip(&self, t: &WellTarget, result: &CommandResult) -> Result<Vec<StateChange>> {
        let pipette = self.pipette(&t.pipette_id)?;
        if pipette.has_tip() {
            return Err(self.violation(format!("pipette {} already has a tip", t.pipette_id)));
        }
        let rack = self.well(t)?;
        let rack_tip_volume = rack
            .tip_volume
            .ok_or_else(|| self.violation(format!("labware {} is not a tip rack", t.labware_id)))?;
        if !rack.has_tip(&t.well_name) {
            return Err(self.violation(format!(
                "no tip left at {} of {}",
                t.well_name, t.labware_id
            )));
        }
        let tip_volume = match result {
            CommandResult::TipPickedUp { tip_volume } => *tip_volume,
            _ => rack_tip_volume,
        };
        Ok(vec![
            Self::moved_to(t),
            StateChange::TipConsumed {
                labware_id: t.labware_id.clone(),
                well_name: t.well_name.clone(),
            },
            StateChange::TipAttached {
                pipette_id: t.pipette_id.clone(),
                tip_volume,
            },
            StateChange::PipetteVolumeSet {
                pipette_id: t.pipette_id.clone(),
                volume: 0.0,
            },
        ])
    }

    fn aspirate(&self, p: &LiquidHandlingParams, result: &CommandResult) -> Result<Vec<StateChange>> {
        let t = &p.target;
        let pipette = self.pipette_with_tip(&t.pipette_id)?;
        self.well(t)?;

        let volume = result.volume().unwrap_or(p.volume);
        let held = pipette.aspirated_volume + volume;
        if held > pipette.working_volume() + VOLUME_TOLERANCE {
            return Err(self.violation(format!(
                "aspirating {} µL would hold {} µL, above the {} µL working volume of {}",
                volume,
                held,
                pipette.working_volume(),
                t.pipette_id
            )));
        }

        let mut changes = vec![
            Self::moved_to(t),
            StateChange::PipetteVolumeSet {
                pipette_id: t.pipette_id.clone(),
                volume: held,
            },
        ];
        if let Some(current) = self.state.well_volume(&t.labware_id, &t.well_name) {
            changes.push(StateChange::WellVolumeSet {
                labware_id: t.labware_id.clone(),
                well_name: t.well_name.clone(),
                volume: Some((current - volume).max(0.0)),
            });
        }
        Ok(changes)
    }

    fn dispense(&self, p: &LiquidHandlingParams, result: &CommandResult) -> Result<Vec<StateChange>> {
        let t = &p.target;
        let pipette = self.pipette_with_tip(&t.pipette_id)?;
        self.well(t)?;

        // Never dispense more than is held.
        let requested = result.volume().unwrap_or(p.volume);
        let dispensed = requested.min(pipette.aspirated_volume);

        let mut changes = vec![
            Self::moved_to(t),
            StateChange::PipetteVolumeSet {
                pipette_id: t.pipette_id.clone(),
                volume: pipette.aspirated_volume - dispensed,
            },
        ];
        if let Some(current) = self.state.well_volume(&t.labware_id, &t.well_name) {
            changes.push(StateChange::WellVolumeSet {
                labware_id: t.labware_id.clone(),
                well_name: t.well_name.clone(),
                volume: Some(current + dispensed),
            });
        }
        Ok(changes)
    }

    fn drop_tip(&self, p: &DropTipParams) -> Result<Vec<StateChange>> {
        self.pipette_with_tip(&p.pipette_id)?;
        let mut changes = Vec::new();
        if let (Some(labware_id), Some(well_name)) = (&p.labware_id, &p.well_name) {
            let target = WellTarget {
                pipette_id: p.pipette_id.clone(),
                labware_id: labware_id.clone(),
                well_name: well_name.clone(),
            };
            self.well(&target)?;
            changes.push(Self::moved_to(&target));
        }
        changes.push(StateChange::TipDetached {
            pipette_id: p.pipette_id.clone(),
        });
        changes.push(StateChange::PipetteVolumeSet {
            pipette_id: p.pipette_id.clone(),
            volume: 0.0,
        });
        Ok(changes)
    }

    fn failed(&self, params: &CommandParams, error: &CommandError) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if let CommandError::Defined(defined) = error {
            changes.extend(self.physical_effects(params, defined));
        }
        changes.push(StateChange::ErrorRecorded {
            command_id: self.command_id.clone(),
            error: error.clone(),
        });
        changes
    }

    /// What a defined failure is known to have done to the deck.
    fn physical_effects(&self, params: &CommandParams, error: &DefinedError) -> Vec<StateChange> {
        match (error.error_type, params) {
            // The tip is gone from the rack whether or not it reached the nozzle.
            (ErrorType::TipNotDetected, CommandParams::PickUpTip(t)) => {
                match self.state.labware.get(&t.labware_id) {
                    Some(rack) if rack.has_tip(&t.well_name) => vec![StateChange::TipConsumed {
                        labware_id: t.labware_id.clone(),
                        well_name: t.well_name.clone(),
                    }],
                    _ => Vec::new(),
                }
            }
            // A tip that cannot be seen mid-transfer is treated as lost,
            // along with whatever it held.
            (ErrorType::TipNotDetected, CommandParams::Aspirate(_))
            | (ErrorType::TipNotDetected, CommandParams::Dispense(_))
            | (ErrorType::TipNotDetected, CommandParams::BlowOut(_)) => {
                match params.pipette_id() {
                    Some(pipette_id) if self.state.tip_attached(pipette_id) => vec![
                        StateChange::TipDetached {
                            pipette_id: pipette_id.clone(),
                        },
                        StateChange::PipetteVolumeSet {
                            pipette_id: pipette_id.clone(),
                            volume: 0.0,
                        },
                    ],
                    _ => Vec::new(),
                }
            }
            (ErrorType::StallOrCollision, _) => vec![StateChange::PositionLost],
            _ => Vec::new(),
        }
    }
}
