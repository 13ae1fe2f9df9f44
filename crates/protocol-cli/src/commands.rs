//! Command handlers for CLI subcommands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use protocol_engine::{
    EngineConfig, EngineStore, RecoveryPolicy, RecoveryRule, RunHandle, RunSummary,
    SimulatingDispatcher,
};
use protocol_events::RunEvent;
use protocol_models::{Command, CommandId, CommandIntent, DefinedError, RunLifecycle};
use protocol_persistence::JsonJournal;
use protocol_queue::CommandFilter;
use protocol_state::StateSnapshot;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cli::{Commands, InjectedFailure, OutputFormat};
use crate::protocol_file::ProtocolFile;

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Options for `simulate`.
#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    pub failures: Vec<InjectedFailure>,
    pub auto_recover: bool,
    pub delay: Duration,
    pub journal: bool,
    pub format: OutputFormat,
}

/// Everything `simulate --format json` prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub summary: RunSummary,
    pub commands: Vec<Command>,
    pub events: Vec<RunEvent>,
    pub state: StateSnapshot,
}

/// Execute a CLI command.
pub fn execute(command: Commands, state_dir: &Path) -> Result<()> {
    match command {
        Commands::Simulate {
            protocol,
            policy,
            failures,
            auto_recover,
            delay_ms,
            journal,
            format,
        } => {
            let options = SimulateOptions {
                failures,
                auto_recover,
                delay: Duration::from_millis(delay_ms),
                journal,
                format,
            };
            let runtime = tokio::runtime::Runtime::new()?;
            let report =
                runtime.block_on(cmd_simulate(&protocol, policy.as_deref(), state_dir, &options))?;
            print_report(&report, options.format)?;
            match &report.summary.status.run_error {
                Some(error) => Err(format!("run failed: {}", error).into()),
                None => Ok(()),
            }
        }
        Commands::CheckPolicy { policy } => cmd_check_policy(&policy),
        Commands::Runs { format } => cmd_runs(state_dir, format),
    }
}

/// Runs a protocol file to completion against the simulating dispatcher.
pub async fn cmd_simulate(
    protocol: &Path,
    policy: Option<&Path>,
    state_dir: &Path,
    options: &SimulateOptions,
) -> Result<SimulationReport> {
    let file = ProtocolFile::load(protocol)?;
    let policy = match policy {
        Some(path) => RecoveryPolicy::from_json_file(path)?,
        None => RecoveryPolicy::never_recover(),
    };

    let mut dispatcher = SimulatingDispatcher::new();
    if !options.delay.is_zero() {
        dispatcher = dispatcher.with_delay(options.delay);
    }
    for failure in &options.failures {
        let key = file.key_at(failure.index).ok_or_else(|| {
            format!(
                "--fail {}: protocol only has {} commands",
                failure.index,
                file.len()
            )
        })?;
        dispatcher = dispatcher.with_failure(
            key,
            DefinedError::new(failure.error_type, "injected by --fail"),
        );
    }

    let mut config = EngineConfig::new().with_event_capacity(file.len() * 8 + 64);
    if options.journal {
        config = config.with_journal_dir(state_dir.join("journal"));
    }
    let engine = EngineStore::new(config, Arc::new(dispatcher));
    let mut events = engine.subscribe();

    let run = engine.create_run(Some(policy)).await?;
    info!(run_id = %run.id(), commands = file.len(), "simulating protocol");
    for request in file.commands {
        run.enqueue(request)?;
    }
    run.play()?;
    drive(&run, options.auto_recover).await?;

    let summary = engine.clear().await?;
    Ok(SimulationReport {
        summary,
        commands: run.commands(&CommandFilter::new())?,
        events: drain(&mut events),
        state: StateSnapshot::clone(&run.state()),
    })
}

/// Stands in for the operator until the run ends: resumes operator pauses,
/// and either retries or stops on recovery.
async fn drive(run: &RunHandle, auto_recover: bool) -> Result<()> {
    let mut status_rx = run.subscribe_status();
    loop {
        let status = status_rx.borrow_and_update().clone();
        match status.lifecycle {
            RunLifecycle::Paused => {
                info!(run_id = %run.id(), "resuming after operator pause");
                run.play()?;
            }
            RunLifecycle::AwaitingRecovery if auto_recover => {
                info!(run_id = %run.id(), "resuming from recovery");
                run.resume_from_recovery()?;
            }
            RunLifecycle::AwaitingRecovery => {
                warn!(
                    run_id = %run.id(),
                    failed_command = ?status.recovery_target,
                    "no operator to recover, stopping run"
                );
                run.stop()?;
            }
            lifecycle if lifecycle.is_terminal() => return Ok(()),
            _ => {}
        }
        if status_rx.changed().await.is_err() {
            return Ok(());
        }
    }
}

fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                warn!(missed, "event log lagged, some events are missing");
            }
            Err(_) => break,
        }
    }
    events
}

fn print_report(report: &SimulationReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            println!("Events:");
            for event in &report.events {
                println!("  {}", describe_event(event, &report.commands));
            }
            println!();

            println!(
                "{:<4}  {:<14}  {:<38}  {:<8}  {:<10}  ERROR",
                "#", "KEY", "TYPE", "INTENT", "STATUS"
            );
            println!("{}", "-".repeat(96));
            for (i, command) in report.commands.iter().enumerate() {
                println!(
                    "{:<4}  {:<14}  {:<38}  {:<8}  {:<10}  {}",
                    i + 1,
                    truncate(&command.key, 14),
                    command.command_type().to_string(),
                    command.intent.to_string(),
                    command.status.to_string(),
                    command
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default()
                );
            }
            println!();
            print_summary(&report.summary);
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let status = &summary.status;
    let counts = &summary.commands;
    println!("Run: {}", summary.run_id);
    println!("  Lifecycle: {}", status.lifecycle);
    println!(
        "  Commands: {} total, {} succeeded, {} failed, {} queued",
        counts.total, counts.succeeded, counts.failed, counts.queued
    );
    if let (Some(started), Some(completed)) = (status.started_at, status.completed_at) {
        let elapsed = completed - started;
        println!("  Elapsed: {} ms", elapsed.num_milliseconds());
    }
    if let Some(error) = &status.run_error {
        println!("  Error: {}", error);
    }
}

fn describe_event(event: &RunEvent, commands: &[Command]) -> String {
    let key = |id: &CommandId| {
        commands
            .iter()
            .find(|c| &c.id == id)
            .map(|c| c.key.clone())
            .unwrap_or_else(|| id.to_string())
    };
    match event {
        RunEvent::LifecycleChanged { from, to, .. } => format!("lifecycle  {} -> {}", from, to),
        RunEvent::CommandEnqueued {
            command_id,
            command_type,
            intent,
            ..
        } => match intent {
            CommandIntent::Protocol => format!("queued     {} {}", key(command_id), command_type),
            _ => format!(
                "queued     {} {} ({})",
                key(command_id),
                command_type,
                intent
            ),
        },
        RunEvent::CommandStarted {
            command_id,
            command_type,
            ..
        } => format!("started    {} {}", key(command_id), command_type),
        RunEvent::CommandSucceeded {
            command_id,
            command_type,
            ..
        } => format!("succeeded  {} {}", key(command_id), command_type),
        RunEvent::CommandFailed {
            command_id,
            error,
            verdict,
            ..
        } => match verdict {
            Some(verdict) => format!("failed     {} {} => {}", key(command_id), error, verdict),
            None => format!("failed     {} {}", key(command_id), error),
        },
        RunEvent::StateInvariantViolated {
            command_id, detail, ..
        } => format!("VIOLATION  {} {}", key(command_id), detail),
    }
}

fn cmd_check_policy(path: &Path) -> Result<()> {
    let policy = RecoveryPolicy::from_json_file(path)?;

    println!("Policy OK: {}", path.display());
    println!("  Enabled: {}", policy.enabled);
    if policy.rules.is_empty() {
        println!("  Rules: none");
    } else {
        println!("  Rules (first match wins):");
        for (i, rule) in policy.rules.iter().enumerate() {
            println!("    {}. {}", i + 1, describe_rule(rule));
        }
    }
    let recoverable: Vec<String> = policy
        .recoverable_error_types
        .iter()
        .map(|t| t.to_string())
        .collect();
    if recoverable.is_empty() {
        println!("  Otherwise: FAIL_RUN");
    } else {
        println!(
            "  Otherwise: WAIT_FOR_RECOVERY for {}, else FAIL_RUN",
            recoverable.join(", ")
        );
    }
    Ok(())
}

fn describe_rule(rule: &RecoveryRule) -> String {
    let command_type = rule
        .command_type
        .map(|t| t.to_string())
        .unwrap_or_else(|| "*".to_string());
    let error_type = rule
        .error_type
        .map(|t| t.to_string())
        .unwrap_or_else(|| "*".to_string());
    format!("{} / {} -> {}", command_type, error_type, rule.verdict)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JournaledRunRow {
    run_id: String,
    lifecycle: Option<RunLifecycle>,
    commands: usize,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn cmd_runs(state_dir: &Path, format: OutputFormat) -> Result<()> {
    let journal = JsonJournal::new(state_dir.join("journal"));
    let mut rows = Vec::new();
    for run_id in journal.list_runs()? {
        let run = journal.load_run(&run_id)?;
        rows.push(JournaledRunRow {
            run_id: run_id.to_string(),
            lifecycle: run.record.as_ref().map(|r| r.lifecycle),
            commands: run.commands.len(),
            updated_at: run.record.as_ref().map(|r| r.updated_at),
        });
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No journaled runs in {}", journal.base_path().display());
                return Ok(());
            }
            println!("{:<40}  {:<16}  {:>8}  UPDATED", "RUN", "LIFECYCLE", "COMMANDS");
            println!("{}", "-".repeat(90));
            for row in &rows {
                println!(
                    "{:<40}  {:<16}  {:>8}  {}",
                    row.run_id,
                    row.lifecycle
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    row.commands,
                    row.updated_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default()
                );
            }
            println!("\n{} run(s)", rows.len());
        }
    }
    Ok(())
}

/// Truncates a string to the given length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
