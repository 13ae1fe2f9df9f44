//! Run journals: where the engine records commands and state deltas.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use protocol_models::{Command, CommandId, RunId, RunLifecycle, StateDelta};
use serde::{Deserialize, Serialize};

use crate::atomic::{append_json_line, read_json, read_json_lines, replace_json};
use crate::error::{PersistenceError, Result};

/// Sink for everything needed to rebuild a run after a crash.
///
/// The engine treats every method as best-effort: a failing journal is
/// logged and never stops a run.
pub trait RunJournal: Send + Sync {
    /// Records a command. Called on enqueue and on every status change, so
    /// the latest record per command ID wins.
    fn append_command(&self, run_id: &RunId, command: &Command) -> Result<()>;

    /// Records a delta produced by the state store.
    fn append_state_delta(&self, run_id: &RunId, delta: &StateDelta) -> Result<()>;

    /// Records a lifecycle transition.
    fn record_lifecycle(&self, _run_id: &RunId, _lifecycle: RunLifecycle) -> Result<()> {
        Ok(())
    }
}

/// Journal that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

impl RunJournal for NoopJournal {
    fn append_command(&self, _run_id: &RunId, _command: &Command) -> Result<()> {
        Ok(())
    }

    fn append_state_delta(&self, _run_id: &RunId, _delta: &StateDelta) -> Result<()> {
        Ok(())
    }
}

/// Metadata file kept next to a run's logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    pub lifecycle: RunLifecycle,
    pub updated_at: DateTime<Utc>,
}

/// Everything a journal holds for one run.
#[derive(Debug, Clone, Default)]
pub struct JournaledRun {
    pub record: Option<RunRecord>,
    /// Latest version of each command, in first-enqueued order.
    pub commands: Vec<Command>,
    pub deltas: Vec<StateDelta>,
}

/// File-backed journal.
///
/// ```text
/// base_path/
/// └── runs/
///     └── {run_id}/
///         ├── run.json          (replaced atomically)
///         ├── commands.jsonl    (append-only)
///         └── deltas.jsonl      (append-only)
/// ```
pub struct JsonJournal {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonJournal {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn runs_dir(&self) -> PathBuf {
        self.base_path.join("runs")
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(run_id.as_str())
    }

    fn append<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        append_json_line(path, value)
    }

    /// Lists journaled run IDs, sorted.
    pub fn list_runs(&self) -> Result<Vec<RunId>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| PersistenceError::ReadError {
            path: dir.clone(),
            source,
        })?;

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PersistenceError::ReadError {
                path: dir.clone(),
                source,
            })?;
            if entry.path().is_dir() {
                runs.push(RunId::from_string(entry.file_name().to_string_lossy()));
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Loads a run's journal.
    pub fn load_run(&self, run_id: &RunId) -> Result<JournaledRun> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Err(PersistenceError::RunNotFound(run_id.to_string()));
        }

        let record_path = dir.join("run.json");
        let record = if record_path.exists() {
            Some(read_json(&record_path)?)
        } else {
            None
        };

        let raw: Vec<Command> = read_json_lines(&dir.join("commands.jsonl"))?;
        let mut index: HashMap<CommandId, usize> = HashMap::new();
        let mut commands: Vec<Command> = Vec::new();
        for command in raw {
            match index.get(&command.id) {
                Some(&i) => commands[i] = command,
                None => {
                    index.insert(command.id.clone(), commands.len());
                    commands.push(command);
                }
            }
        }

        let mut deltas: Vec<StateDelta> = read_json_lines(&dir.join("deltas.jsonl"))?;
        deltas.sort_by_key(|d| d.sequence);

        Ok(JournaledRun {
            record,
            commands,
            deltas,
        })
    }
}

impl RunJournal for JsonJournal {
    fn append_command(&self, run_id: &RunId, command: &Command) -> Result<()> {
        self.append(&self.run_dir(run_id).join("commands.jsonl"), command)
    }

    fn append_state_delta(&self, run_id: &RunId, delta: &StateDelta) -> Result<()> {
        self.append(&self.run_dir(run_id).join("deltas.jsonl"), delta)
    }

    fn record_lifecycle(&self, run_id: &RunId, lifecycle: RunLifecycle) -> Result<()> {
        let record = RunRecord {
            run_id: run_id.clone(),
            lifecycle,
            updated_at: Utc::now(),
        };
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        replace_json(&self.run_dir(run_id).join("run.json"), &record)
    }
}

/// In-memory journal, handy for inspecting what the engine recorded.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    inner: Mutex<MemoryJournalState>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryJournalState {
    pub commands: Vec<(RunId, Command)>,
    pub deltas: Vec<(RunId, StateDelta)>,
    pub lifecycles: Vec<(RunId, RunLifecycle)>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn contents(&self) -> Result<MemoryJournalState> {
        self.inner
            .lock()
            .map(|state| state.clone())
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))
    }

    fn with_state(&self, f: impl FnOnce(&mut MemoryJournalState)) -> Result<()> {
        let mut state = self
            .inner
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        f(&mut state);
        Ok(())
    }
}

impl RunJournal for MemoryJournal {
    fn append_command(&self, run_id: &RunId, command: &Command) -> Result<()> {
        self.with_state(|s| s.commands.push((run_id.clone(), command.clone())))
    }

    fn append_state_delta(&self, run_id: &RunId, delta: &StateDelta) -> Result<()> {
        self.with_state(|s| s.deltas.push((run_id.clone(), delta.clone())))
    }

    fn record_lifecycle(&self, run_id: &RunId, lifecycle: RunLifecycle) -> Result<()> {
        self.with_state(|s| s.lifecycles.push((run_id.clone(), lifecycle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_models::{
        CommandOutcome, CommandParams, CommandRequest, CommandResult, CommandStatus,
        CommentParams, StateChange,
    };
    use tempfile::tempdir;

    fn comment(message: &str) -> Command {
        Command::from_request(CommandRequest::protocol(CommandParams::Comment(
            CommentParams {
                message: message.to_string(),
            },
        )))
    }

    #[test]
    fn test_latest_command_record_wins_in_enqueue_order() {
        let dir = tempdir().unwrap();
        let journal = JsonJournal::new(dir.path());
        let run_id = RunId::new();

        let mut first = comment("first");
        let second = comment("second");
        journal.append_command(&run_id, &first).unwrap();
        journal.append_command(&run_id, &second).unwrap();

        first.start();
        first.finish(CommandOutcome::Succeeded(CommandResult::Empty));
        journal.append_command(&run_id, &first).unwrap();

        let loaded = journal.load_run(&run_id).unwrap();
        assert_eq!(loaded.commands.len(), 2);
        assert_eq!(loaded.commands[0].id, first.id);
        assert_eq!(loaded.commands[0].status, CommandStatus::Succeeded);
        assert_eq!(loaded.commands[1].status, CommandStatus::Queued);
    }

    #[test]
    fn test_deltas_and_lifecycle() {
        let dir = tempdir().unwrap();
        let journal = JsonJournal::new(dir.path());
        let run_id = RunId::new();

        let change = StateChange::TipDetached {
            pipette_id: "p1".into(),
        };
        journal
            .append_state_delta(&run_id, &StateDelta::new("cmd-2".into(), 2, vec![change.clone()]))
            .unwrap();
        journal
            .append_state_delta(&run_id, &StateDelta::new("cmd-1".into(), 1, vec![change]))
            .unwrap();
        journal.record_lifecycle(&run_id, RunLifecycle::Running).unwrap();
        journal.record_lifecycle(&run_id, RunLifecycle::Finished).unwrap();

        let loaded = journal.load_run(&run_id).unwrap();
        let sequences: Vec<u64> = loaded.deltas.iter().map(|d| d.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(loaded.record.unwrap().lifecycle, RunLifecycle::Finished);
        assert_eq!(journal.list_runs().unwrap(), vec![run_id]);
    }

    #[test]
    fn test_load_unknown_run() {
        let dir = tempdir().unwrap();
        let journal = JsonJournal::new(dir.path());
        let result = journal.load_run(&RunId::new());
        assert!(matches!(result, Err(PersistenceError::RunNotFound(_))));
    }

    #[test]
    fn test_noop_and_memory_journals() {
        let run_id = RunId::new();
        let command = comment("noop");
        assert!(NoopJournal.append_command(&run_id, &command).is_ok());

        let memory = MemoryJournal::new();
        memory.append_command(&run_id, &command).unwrap();
        memory.record_lifecycle(&run_id, RunLifecycle::Ready).unwrap();
        let contents = memory.contents().unwrap();
        assert_eq!(contents.commands.len(), 1);
        assert_eq!(contents.lifecycles, vec![(run_id, RunLifecycle::Ready)]);
    }
}
