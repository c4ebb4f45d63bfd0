//! Handoff - staged workflow orchestration with validated artifact handoffs
//!
//! Main entry point for the Handoff CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{artifact, config, resume, run, status, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Handoff - staged workflow orchestration with validated artifact handoffs
#[derive(Parser)]
#[command(name = "handoff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// User config directory (default: ~/.config/handoff)
    #[arg(long, global = true, env = "HANDOFF_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Pipeline config file, merged over the discovered layers
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for artifacts, checkpoints and the audit log
    #[arg(long, global = true, env = "HANDOFF_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a workflow and drive it with the configured stage commands
    Run(run::RunArgs),

    /// Restart a workflow from a checkpoint and keep driving it
    Resume(resume::ResumeArgs),

    /// Show recoverable workflows, or one workflow's checkpoints and failures
    Status(status::StatusArgs),

    /// Validate an artifact file against a stage's schema and rules
    Validate(validate::ValidateArgs),

    /// Show a stored artifact and its provenance
    Artifact(artifact::ArtifactArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        config_dir: cli.config_dir,
        config_file: cli.config,
        state_dir: cli.state_dir,
    };

    // Console (stderr, human-readable) + daily-rolling JSON file
    let filter = if ctx.verbose {
        "handoff=debug,handoff_pipeline=debug,handoff_config=debug,info"
    } else {
        "handoff=info,warn"
    };
    let logging = ctx
        .load_config()
        .map(|loaded| loaded.config.logging())
        .unwrap_or_default();
    let log_dir = logging
        .directory
        .clone()
        .or_else(|| ctx.user_config_dir().map(|d| d.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"));

    use tracing_subscriber::prelude::*;
    let (file_layer, _guard) = if logging.file {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "handoff.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(tracing_subscriber::EnvFilter::new(
                "handoff=trace,handoff_pipeline=trace,handoff_config=trace,info",
            ));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(file_layer)
        .init();

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Resume(args) => resume::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Artifact(args) => artifact::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
