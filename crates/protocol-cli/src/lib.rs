//! Command-line front end for the protocol execution engine.
//!
//! `protocol-engine simulate` runs a JSON command list against the
//! simulating dispatcher; `protocol-engine check-policy` validates a
//! recovery policy file; `protocol-engine runs` lists journaled runs.

pub mod cli;
pub mod commands;
pub mod protocol_file;
