//! Command queue for the protocol execution engine.
//!
//! [`CommandQueue`] keeps three FIFO lanes (setup, main, fixit) on top of an
//! append-only command history and is the only place command status
//! changes:
//! - `enqueue` validates params and enforces lane rules against the run
//!   lifecycle
//! - `next_eligible` picks setup, then main while running, and only fixit
//!   commands while the run awaits recovery
//! - `mark_running` / `mark_terminal` move a command through
//!   QUEUED -> RUNNING -> SUCCEEDED | FAILED, one at a time

pub mod error;
pub mod filter;
pub mod queue;

pub use error::{QueueError, Result};
pub use filter::CommandFilter;
pub use queue::{CommandQueue, CommandSlice, CurrentCommand};
