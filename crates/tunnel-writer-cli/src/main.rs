//! Tunnel Writer CLI - partitioned bulk upload tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnel_writer_core::config::{LogFormat, LogLevel};
use tunnel_writer_core::{Error, WriterConfig};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Table metadata error (lookup, view target, partition listing)
    MetadataError = 2,
    /// Partition preparation error (create, delete, truncate)
    PartitionError = 3,
    /// Upload session or block error
    SessionError = 4,
    /// Commit failed or was withheld
    CommitError = 5,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code, by variant when it is a writer error and
    /// by message otherwise.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(err) = error.downcast_ref::<Error>() {
            return match err {
                Error::Config(_)
                | Error::UnsupportedAccountType(_)
                | Error::UnresolvedColumns { .. }
                | Error::Serialization(_)
                | Error::Io(_) => ExitCode::ConfigError,
                Error::UnsupportedTableKind { .. }
                | Error::Catalog { .. }
                | Error::PartitionList { .. } => ExitCode::MetadataError,
                Error::CreatePartition { .. }
                | Error::DeletePartition { .. }
                | Error::Truncate { .. } => ExitCode::PartitionError,
                Error::MasterSession { .. }
                | Error::SlaveSession { .. }
                | Error::Block { .. }
                | Error::TaskLost { .. } => ExitCode::SessionError,
                Error::Commit { .. } | Error::Aborted { .. } => ExitCode::CommitError,
            };
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") || error_str.contains("parse")
        {
            ExitCode::ConfigError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "tunnel-writer")]
#[command(about = "Partitioned bulk upload through tunnel sessions", long_about = None)]
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
    /// Validate configuration file and build the connection
    Validate,

    /// Run the whole job against an in-memory service
    DryRun {
        /// Synthetic rows to write
        #[arg(long, default_value_t = 1000)]
        rows: usize,

        /// Concurrent tasks
        #[arg(long, default_value_t = 4)]
        tasks: usize,
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

    // Logging settings come from the config when it parses; validation happens later
    let (log_level, log_format) = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<WriterConfig>(&content).ok())
        .map(|config| (config.logging.log_level, config.logging.log_format))
        .unwrap_or((LogLevel::Info, LogFormat::Json));

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(log_level.as_str()),
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
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate => {
            let config = load_config(&cli.config)?;
            commands::validate::run(&config)?;
        }

        Commands::DryRun { rows, tasks } => {
            let config = load_config(&cli.config)?;
            commands::dry_run::run(config, rows, tasks).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<WriterConfig> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));
    Ok(WriterConfig::from_file(&path)?)
}
