pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dosecheck_core::config::{AppConfig, LoadOptions};

#[derive(Debug, Parser)]
#[command(
    name = "dosecheck",
    about = "Dosecheck operator CLI",
    long_about = "Inspect checkout configuration, run readiness checks, and replay checkout scenarios.",
    after_help = "Examples:\n  dosecheck doctor --json\n  dosecheck config\n  dosecheck replay scenario.json --correlation-id req-1"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "Validate config, feature-flag coherence, and server-call timeouts")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Drive a checkout session through a JSON scenario and print the transcript")]
    Replay {
        #[arg(help = "Path to the scenario JSON file")]
        scenario: PathBuf,
        #[arg(long, help = "Correlation id recorded on every audit event")]
        correlation_id: Option<String>,
    },
}

fn init_logging() {
    use dosecheck_core::config::LogFormat::*;
    use tracing::Level;

    let config = AppConfig::load(LoadOptions::default()).unwrap_or_default();
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    // stdout carries command output; logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);
    let _ = match config.logging.format {
        Compact => builder.compact().try_init(),
        Pretty => builder.pretty().try_init(),
        Json => builder.json().try_init(),
    };
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Replay { scenario, correlation_id } => {
            commands::replay::run(&scenario, correlation_id.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
