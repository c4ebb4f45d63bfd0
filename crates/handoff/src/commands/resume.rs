//! Resume command - restart a workflow from a checkpoint and keep driving it.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use handoff_pipeline::ExecutorRegistry;

use super::{Context, run::drive, short};

/// Arguments for the resume command.
#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Workflow to resume
    pub workflow_id: String,

    /// Checkpoint to restore (default: the workflow's latest)
    #[arg(long)]
    pub checkpoint: Option<String>,
}

/// Run the resume command.
pub async fn run(args: ResumeArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_pipeline()?;
    let registry = ExecutorRegistry::from_config(&loaded.config);
    let engine = ctx.open_engine(&loaded)?;

    let phase = engine.resume(&args.workflow_id, args.checkpoint.as_deref())?;
    let checkpoint = engine.workflow(&args.workflow_id)?.last_checkpoint;
    tracing::info!(
        workflow_id = %args.workflow_id,
        phase = %phase,
        "Workflow resumed"
    );

    if !ctx.json_output {
        let dim = Style::new().dim();
        println!();
        println!(
            "{} {}",
            style("Resuming").bold(),
            style(&args.workflow_id).cyan()
        );
        println!("{}", dim.apply_to("─".repeat(40)));
        if let Some(ref id) = checkpoint {
            println!("  {} {}", dim.apply_to("Checkpoint:"), short(id));
        }
        println!("  {} {}", dim.apply_to("Phase:"), phase);
    }

    drive(engine, registry, &args.workflow_id, ctx).await
}
