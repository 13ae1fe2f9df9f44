//! protocol-engine CLI entry point.

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use protocol_cli::cli::Cli;
use protocol_cli::commands;

fn main() {
    // Optional local overrides, e.g. RUST_LOG or PROTOCOL_ENGINE_STATE_DIR
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().to_string()));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let state_dir = cli.state_dir();
    if let Err(e) = commands::execute(cli.command, &state_dir) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
