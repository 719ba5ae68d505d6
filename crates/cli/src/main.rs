//! Right-sizing scanner CLI
//!
//! Scans Kubernetes workloads, compares their CPU and memory settings with
//! historical usage from Prometheus and prints recommendations.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::{scan, strategies};
use scan_lib::ScanStatus;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Kubernetes resource right-sizing scanner
#[derive(Debug, Parser)]
#[command(name = "rsz")]
#[command(author, version, about = "Kubernetes resource right-sizing scanner", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ~/.config/rsz/config.{yaml,toml,json})
    #[arg(long, global = true, env = "RSZ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Log line format (logs go to stderr)
    #[arg(long, global = true, default_value = "compact")]
    pub log_format: LogFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan clusters and print right-sizing recommendations
    Scan(scan::ScanArgs),

    /// List available recommendation strategies
    Strategies,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Process exit status for a finished scan
fn exit_status(status: ScanStatus) -> u8 {
    match status {
        ScanStatus::Complete => 0,
        ScanStatus::Partial => 2,
        ScanStatus::Failed => 1,
    }
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

async fn run(cli: Cli) -> Result<ScanStatus> {
    match cli.command {
        Commands::Scan(args) => scan::run(args, cli.config, cli.kubeconfig, cli.format).await,
        Commands::Strategies => {
            strategies::list(cli.format)?;
            Ok(ScanStatus::Complete)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    match run(cli).await {
        Ok(status) => ExitCode::from(exit_status(status)),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(1)
        }
    }
}
