//! Command-line interface definition using clap.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use protocol_models::ErrorType;

/// protocol-engine - run lab protocols against a simulated robot
#[derive(Parser, Debug)]
#[command(name = "protocol-engine")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to state directory (journals live under it)
    #[arg(short, long, env = "PROTOCOL_ENGINE_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a protocol file against the simulating dispatcher
    Simulate {
        /// JSON file with the command list
        #[arg(required = true)]
        protocol: PathBuf,

        /// Recovery policy file (default: fail the run on any error)
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Make the command at INDEX (1-based) fail with ERROR_TYPE
        #[arg(long = "fail", value_name = "INDEX:ERROR_TYPE", value_parser = parse_failure)]
        failures: Vec<InjectedFailure>,

        /// Resume automatically after a recovery pause instead of stopping
        #[arg(long)]
        auto_recover: bool,

        /// Simulated duration of each hardware command, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        /// Journal the run under the state directory
        #[arg(long)]
        journal: bool,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Validate a recovery policy file
    CheckPolicy {
        #[arg(required = true)]
        policy: PathBuf,
    },

    /// List journaled runs
    Runs {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Output format for reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// A `--fail INDEX:ERROR_TYPE` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedFailure {
    /// 1-based position in the protocol file.
    pub index: usize,
    pub error_type: ErrorType,
}

fn parse_failure(s: &str) -> Result<InjectedFailure, String> {
    let (index, error_type) = s
        .split_once(':')
        .ok_or_else(|| format!("expected INDEX:ERROR_TYPE, got '{}'", s))?;
    let index: usize = index
        .trim()
        .parse()
        .map_err(|_| format!("invalid command index '{}'", index))?;
    if index == 0 {
        return Err("command indexes start at 1".to_string());
    }
    let error_type = ErrorType::from_str(error_type.trim())?;
    Ok(InjectedFailure { index, error_type })
}

impl Cli {
    /// Returns the state directory path, using default if not specified.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".protocol-engine"))
                .unwrap_or_else(|| PathBuf::from(".protocol-engine"))
        })
    }

    /// Returns the log level based on verbosity.
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse_simulate() {
        let cli = Cli::parse_from([
            "protocol-engine",
            "simulate",
            "transfer.json",
            "--policy",
            "policy.json",
            "--fail",
            "2:tip-not-detected",
            "--fail",
            "5:overpressure",
            "--format",
            "json",
        ]);
        match cli.command {
            Commands::Simulate {
                protocol,
                policy,
                failures,
                format,
                auto_recover,
                ..
            } => {
                assert_eq!(protocol, PathBuf::from("transfer.json"));
                assert_eq!(policy, Some(PathBuf::from("policy.json")));
                assert_eq!(
                    failures,
                    vec![
                        InjectedFailure {
                            index: 2,
                            error_type: ErrorType::TipNotDetected
                        },
                        InjectedFailure {
                            index: 5,
                            error_type: ErrorType::Overpressure
                        },
                    ]
                );
                assert_eq!(format, OutputFormat::Json);
                assert!(!auto_recover);
            }
            other => panic!("expected simulate, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_check_policy() {
        let cli = Cli::parse_from(["protocol-engine", "check-policy", "policy.json"]);
        assert!(matches!(cli.command, Commands::CheckPolicy { .. }));
    }

    #[test]
    fn test_cli_rejects_bad_failure() {
        for bad in ["2", "x:overpressure", "0:overpressure", "3:gremlins"] {
            let result = Cli::try_parse_from(["protocol-engine", "simulate", "p.json", "--fail", bad]);
            assert!(result.is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_cli_verbose_levels() {
        let cli = Cli::parse_from(["protocol-engine", "-vv", "runs"]);
        assert_eq!(cli.log_level(), tracing::Level::DEBUG);

        let cli = Cli::parse_from(["protocol-engine", "runs"]);
        assert_eq!(cli.log_level(), tracing::Level::WARN);
    }

    #[test]
    fn test_cli_state_dir_override() {
        let cli = Cli::parse_from(["protocol-engine", "--state-dir", "/tmp/pe", "runs"]);
        assert_eq!(cli.state_dir(), PathBuf::from("/tmp/pe"));
    }

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }
}
