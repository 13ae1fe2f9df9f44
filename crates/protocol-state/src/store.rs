//! StateStore - the single mutation entry point for robot state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use protocol_models::{Command, CommandError, CommandId, StateDelta};
use tracing::debug;

use crate::error::{Result, StateError};
use crate::planner::plan;
use crate::snapshot::StateSnapshot;

/// What `apply` did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Changed(StateDelta),
    /// This command was applied before; nothing changed.
    AlreadyApplied,
}

struct StoreInner {
    current: Arc<StateSnapshot>,
    applied: HashSet<CommandId>,
    sequence: u64,
}

/// Aggregated state of the deck, pipettes and modules.
///
/// # Apply is atomic and replay-safe
///
/// `apply` first plans every change against the current snapshot without
/// touching it. Only if planning succeeds is a new snapshot built and
/// swapped in, so a rejected command leaves no partial mutation behind.
/// Command IDs that were applied once are remembered, and applying them
/// again is a no-op.
///
/// # Readers never wait on apply for long
///
/// `snapshot()` clones an `Arc` under a short lock. A snapshot handed out
/// is never mutated afterwards.
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                current: Arc::new(StateSnapshot::default()),
                applied: HashSet::new(),
                sequence: 0,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|e| StateError::LockPoisoned(e.to_string()))
    }

    /// Applies a terminal command's outcome.
    ///
    /// Fails with `InvariantViolation` when the outcome contradicts tracked
    /// state (e.g. dropping a tip that was never picked up), and with
    /// `CommandNotTerminal` for queued or running commands.
    pub fn apply(&self, command: &Command) -> Result<Applied> {
        let mut inner = self.lock()?;
        if inner.applied.contains(&command.id) {
            debug!(command_id = %command.id, "command already applied, skipping");
            return Ok(Applied::AlreadyApplied);
        }

        let changes = plan(&inner.current, command)?;
        let sequence = inner.sequence + 1;
        let delta = StateDelta::new(command.id.clone(), sequence, changes);
        commit(&mut inner, &delta);

        debug!(
            command_id = %command.id,
            sequence,
            changes = delta.changes.len(),
            "state applied"
        );
        Ok(Applied::Changed(delta))
    }

    /// Replays a journaled delta. Deltas for already-applied commands are
    /// skipped.
    pub fn apply_delta(&self, delta: &StateDelta) -> Result<Applied> {
        let mut inner = self.lock()?;
        if inner.applied.contains(&delta.command_id) {
            return Ok(Applied::AlreadyApplied);
        }
        commit(&mut inner, delta);
        Ok(Applied::Changed(delta.clone()))
    }

    pub fn snapshot(&self) -> Result<Arc<StateSnapshot>> {
        Ok(Arc::clone(&self.lock()?.current))
    }

    pub fn is_applied(&self, command_id: &CommandId) -> Result<bool> {
        Ok(self.lock()?.applied.contains(command_id))
    }

    /// Rebuilds state from a command history, e.g. one loaded from a journal.
    ///
    /// Terminal commands are applied in completion order. Commands that
    /// failed with an undefined error are skipped: their effect on the deck
    /// is unknown, which is exactly why they end a run.
    pub fn rebuild(commands: &[Command]) -> Result<Self> {
        let store = Self::new();
        let mut finished: Vec<&Command> = commands
            .iter()
            .filter(|c| c.is_terminal())
            .filter(|c| !matches!(c.error, Some(CommandError::Undefined { .. })))
            .collect();
        finished.sort_by_key(|c| c.completed_at);

        for command in finished {
            store.apply(command)?;
        }
        Ok(store)
    }
}

fn commit(inner: &mut StoreInner, delta: &StateDelta) {
    let mut next = StateSnapshot::clone(&inner.current);
    for change in &delta.changes {
        next.apply_change(change, delta.recorded_at);
    }
    inner.sequence = inner.sequence.max(delta.sequence);
    next.sequence = inner.sequence;
    next.updated_at = Some(Utc::now());

    inner.current = Arc::new(next);
    inner.applied.insert(delta.command_id.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use protocol_models::{
        CommandOutcome, CommandParams, CommandRequest, CommandResult, DefinedError,
        DropTipParams, ErrorType, LabwareId, LabwareLocation, LiquidHandlingParams,
        LoadLabwareParams, LoadLiquidParams, LoadPipetteParams, Mount, PipetteId, WellTarget,
    };

    fn finished(params: CommandParams, outcome: CommandOutcome) -> Command {
        let mut command = Command::from_request(CommandRequest::protocol(params));
        command.start();
        command.finish(outcome);
        command
    }

    fn ok(params: CommandParams) -> Command {
        finished(params, CommandOutcome::Succeeded(CommandResult::Empty))
    }

    fn failed(params: CommandParams, error_type: ErrorType) -> Command {
        finished(
            params,
            CommandOutcome::Failed(DefinedError::new(error_type, "simulated").into()),
        )
    }

    fn pick_up(well: &str) -> CommandParams {
        CommandParams::PickUpTip(WellTarget::new("p1", "tips", well))
    }

    fn aspirate(well: &str, volume: f64) -> CommandParams {
        CommandParams::Aspirate(LiquidHandlingParams {
            target: WellTarget::new("p1", "plate", well),
            volume,
            flow_rate: None,
        })
    }

    fn dispense(well: &str, volume: f64) -> CommandParams {
        CommandParams::Dispense(LiquidHandlingParams {
            target: WellTarget::new("p1", "plate", well),
            volume,
            flow_rate: None,
        })
    }

    fn drop_tip() -> CommandParams {
        CommandParams::DropTip(DropTipParams {
            pipette_id: "p1".into(),
            labware_id: None,
            well_name: None,
        })
    }

    /// Pipette, tip rack and a plate with 100 µL in A1 and an empty B1.
    fn loaded_store() -> StateStore {
        let store = StateStore::new();
        let setup = [
            CommandParams::LoadPipette(LoadPipetteParams {
                pipette_id: "p1".into(),
                pipette_name: "p300_single".into(),
                mount: Mount::Left,
                max_volume: 300.0,
            }),
            CommandParams::LoadLabware(LoadLabwareParams {
                labware_id: "tips".into(),
                load_name: "tiprack_300ul".into(),
                location: LabwareLocation::Slot("D1".into()),
                wells: vec!["A1".into(), "A2".into()],
                tip_volume: Some(300.0),
                well_capacity: None,
            }),
            CommandParams::LoadLabware(LoadLabwareParams {
                labware_id: "plate".into(),
                load_name: "plate_96".into(),
                location: LabwareLocation::Slot("D2".into()),
                wells: vec!["A1".into(), "B1".into()],
                tip_volume: None,
                well_capacity: Some(360.0),
            }),
            CommandParams::LoadLiquid(LoadLiquidParams {
                liquid_id: "water".into(),
                labware_id: "plate".into(),
                volume_by_well: BTreeMap::from([("A1".to_string(), 100.0), ("B1".to_string(), 0.0)]),
            }),
        ];
        for params in setup {
            store.apply(&ok(params)).unwrap();
        }
        store
    }

    fn p1() -> PipetteId {
        PipetteId::from("p1")
    }

    fn plate() -> LabwareId {
        LabwareId::from("plate")
    }

    #[test]
    fn test_transfer_moves_liquid_and_tips() {
        let store = loaded_store();
        for params in [pick_up("A1"), aspirate("A1", 50.0), dispense("B1", 50.0), drop_tip()] {
            assert!(matches!(store.apply(&ok(params)).unwrap(), Applied::Changed(_)));
        }

        let state = store.snapshot().unwrap();
        assert!(!state.tip_attached(&p1()));
        assert_eq!(state.aspirated_volume(&p1()), Some(0.0));
        assert_eq!(state.well_volume(&plate(), "A1"), Some(50.0));
        assert_eq!(state.well_volume(&plate(), "B1"), Some(50.0));
        assert_eq!(state.tips_remaining(&LabwareId::from("tips")), Some(1));
    }

    #[test]
    fn test_reapplying_same_command_is_noop() {
        let store = loaded_store();
        let pick = ok(pick_up("A1"));
        store.apply(&pick).unwrap();
        let once = store.snapshot().unwrap();

        assert_eq!(store.apply(&pick).unwrap(), Applied::AlreadyApplied);
        let twice = store.snapshot().unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.tips_remaining(&LabwareId::from("tips")), Some(1));
    }

    #[test]
    fn test_drop_tip_without_tip_is_invariant_violation() {
        let store = loaded_store();
        let before = store.snapshot().unwrap();

        let command = ok(drop_tip());
        let err = store.apply(&command).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(err.to_string().contains("no tip attached"));

        assert_eq!(*store.snapshot().unwrap(), *before);
        assert!(!store.is_applied(&command.id).unwrap());
    }

    #[test]
    fn test_aspirate_over_working_volume_is_rejected_whole() {
        let store = loaded_store();
        store.apply(&ok(pick_up("A1"))).unwrap();
        let before = store.snapshot().unwrap();

        let err = store.apply(&ok(aspirate("A1", 350.0))).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(store.snapshot().unwrap().sequence, before.sequence);
        assert_eq!(store.snapshot().unwrap().well_volume(&plate(), "A1"), Some(100.0));
    }

    #[test]
    fn test_failed_pick_up_consumes_tip_and_logs_error() {
        let store = loaded_store();
        let command = failed(pick_up("A1"), ErrorType::TipNotDetected);
        store.apply(&command).unwrap();

        let state = store.snapshot().unwrap();
        assert!(!state.tip_attached(&p1()));
        assert_eq!(state.tips_remaining(&LabwareId::from("tips")), Some(1));
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors.last().unwrap().command_id, command.id);
    }

    #[test]
    fn test_tip_not_detected_mid_transfer_loses_tip() {
        let store = loaded_store();
        store.apply(&ok(pick_up("A1"))).unwrap();
        store.apply(&failed(aspirate("A1", 50.0), ErrorType::TipNotDetected)).unwrap();

        let state = store.snapshot().unwrap();
        assert!(!state.tip_attached(&p1()));
        assert_eq!(state.well_volume(&plate(), "A1"), Some(100.0));

        store.apply(&ok(pick_up("A2"))).unwrap();
        assert!(store.snapshot().unwrap().tip_attached(&p1()));
    }

    #[test]
    fn test_dispense_never_exceeds_held_volume() {
        let store = loaded_store();
        store.apply(&ok(pick_up("A1"))).unwrap();
        store.apply(&ok(aspirate("A1", 20.0))).unwrap();
        store.apply(&ok(dispense("B1", 50.0))).unwrap();

        let state = store.snapshot().unwrap();
        assert_eq!(state.well_volume(&plate(), "B1"), Some(20.0));
        assert_eq!(state.aspirated_volume(&p1()), Some(0.0));
    }

    #[test]
    fn test_unloaded_entities_are_violations() {
        let store = StateStore::new();
        let err = store.apply(&ok(pick_up("A1"))).unwrap_err();
        assert!(err.to_string().contains("pipette p1 is not loaded"));
    }

    #[test]
    fn test_non_terminal_commands_are_rejected() {
        let store = StateStore::new();
        let command = Command::from_request(CommandRequest::protocol(drop_tip()));
        assert!(matches!(
            store.apply(&command),
            Err(StateError::CommandNotTerminal(_))
        ));
    }

    #[test]
    fn test_deltas_replay_to_same_state() {
        let store = loaded_store();
        store.apply(&ok(pick_up("A1"))).unwrap();
        let mut deltas = Vec::new();
        for params in [aspirate("A1", 30.0), dispense("B1", 30.0)] {
            if let Applied::Changed(delta) = store.apply(&ok(params)).unwrap() {
                deltas.push(delta);
            }
        }

        let replica = loaded_store();
        replica.apply(&ok(pick_up("A1"))).unwrap();
        for delta in &deltas {
            replica.apply_delta(delta).unwrap();
        }
        assert_eq!(replica.apply_delta(&deltas[0]).unwrap(), Applied::AlreadyApplied);

        let a = store.snapshot().unwrap();
        let b = replica.snapshot().unwrap();
        assert_eq!(a.pipettes, b.pipettes);
        assert_eq!(a.liquids, b.liquids);
        assert_eq!(a.sequence, b.sequence);
    }

    #[test]
    fn test_rebuild_skips_undefined_failures() {
        let mut history = vec![
            ok(CommandParams::LoadPipette(LoadPipetteParams {
                pipette_id: "p1".into(),
                pipette_name: "p300_single".into(),
                mount: Mount::Right,
                max_volume: 300.0,
            })),
            finished(
                drop_tip(),
                CommandOutcome::Failed(CommandError::undefined("driver crashed")),
            ),
        ];
        history.push(Command::from_request(CommandRequest::protocol(drop_tip())));

        let store = StateStore::rebuild(&history).unwrap();
        let state = store.snapshot().unwrap();
        assert!(state.pipettes.get(&p1()).is_some());
        assert!(state.errors.is_empty());
        assert!(store.is_applied(&history[0].id).unwrap());
        assert!(!store.is_applied(&history[1].id).unwrap());
    }
}
