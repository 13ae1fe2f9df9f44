//! Crash-safe journaling for protocol runs.
//!
//! The engine records each command (on enqueue and on every status change)
//! and each state delta through the [`RunJournal`] trait. [`JsonJournal`]
//! writes append-only JSON-lines logs plus an atomically replaced run
//! record; [`NoopJournal`] discards everything.
//!
//! # Example
//!
//! ```no_run
//! use protocol_persistence::{JsonJournal, RunJournal};
//! use protocol_models::{RunId, RunLifecycle};
//!
//! let journal = JsonJournal::new("/home/user/.protocol-engine");
//! let run_id = RunId::new();
//! journal.record_lifecycle(&run_id, RunLifecycle::Running).unwrap();
//!
//! let restored = journal.load_run(&run_id).unwrap();
//! println!("{} commands journaled", restored.commands.len());
//! ```

pub mod atomic;
pub mod error;
pub mod journal;

pub use error::{PersistenceError, Result};
pub use journal::{
    JournaledRun, JsonJournal, MemoryJournal, MemoryJournalState, NoopJournal, RunJournal,
    RunRecord,
};
