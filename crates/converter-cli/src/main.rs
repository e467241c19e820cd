//! Rawdata converter CLI - runs and controls converter jobs.

use anyhow::Result;
use clap::{Parser, Subcommand};
use converter_core::config::LogFormat;
use converter_core::error::Error as CoreError;
use converter_core::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Rawdata source error
    SourceError = 2,
    /// Dataset storage error
    StorageError = 4,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by looking for a core error in its chain.
    fn from_error(error: &anyhow::Error) -> Self {
        let core = error.chain().find_map(|e| e.downcast_ref::<CoreError>());
        match core {
            Some(e) if e.is_config_error() => ExitCode::ConfigError,
            Some(CoreError::Source(_)) => ExitCode::SourceError,
            Some(CoreError::Storage(_)) | Some(CoreError::Position(_)) => ExitCode::StorageError,
            Some(_) => ExitCode::RuntimeError,
            None if error.downcast_ref::<std::io::Error>().is_some() => ExitCode::ConfigError,
            None => ExitCode::RuntimeError,
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "rawdata-converter")]
#[command(about = "Converts rawdata streams into columnar datasets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the converter service with its HTTP control plane
    Serve {
        /// Override the HTTP port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show status, jobs and metrics of a running service
    Status {
        /// Service URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Validate configuration file and resolve every predefined job
    Validate,

    /// Print the effective configuration of a job
    Resolve {
        /// Job config name
        job: String,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Config is optional for logging setup, falls back to JSON
    let config = cli
        .config
        .as_ref()
        .and_then(|path| Config::from_file(path).ok());
    let log_format = config
        .as_ref()
        .map(|c| c.monitoring.log_format)
        .unwrap_or(LogFormat::Json);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                config
                    .as_ref()
                    .map_or("info", |c| c.monitoring.log_level.as_filter()),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { port } => {
            let config = load_config(&cli.config)?;
            commands::serve::run(config, port).await?;
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            commands::resolve::validate(&config)?;
        }

        Commands::Resolve { job } => {
            let config = load_config(&cli.config)?;
            commands::resolve::resolve(&config, &job)?;
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));
    Ok(Config::from_file(&path)?)
}
