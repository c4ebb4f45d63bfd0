//! Status command - recoverable workflows and per-workflow history.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use handoff_pipeline::{FailureRecord, RecoverableWorkflow, RecoveryAction};
use serde::Serialize;

use super::{Context, print_json, short};

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Show one workflow's checkpoints and failures
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckpointOutput {
    id: String,
    sequence: u64,
    phase: String,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct WorkflowOutput {
    workflow_id: String,
    checkpoints: Vec<CheckpointOutput>,
    failures: Vec<FailureRecord>,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_pipeline()?;
    let engine = ctx.open_engine(&loaded)?;

    match args.workflow_id {
        None => {
            let recoverable = engine.recoverable_workflows()?;
            if ctx.json_output {
                print_json(&recoverable)?;
            } else {
                print_recoverable(&recoverable);
            }
        }
        Some(workflow_id) => {
            let chain = engine.checkpoint_chain(&workflow_id)?;
            if chain.is_empty() {
                anyhow::bail!("no checkpoints for workflow {}", workflow_id);
            }
            let output = WorkflowOutput {
                checkpoints: chain
                    .iter()
                    .map(|c| CheckpointOutput {
                        id: c.id.clone(),
                        sequence: c.sequence(),
                        phase: c.phase().to_string(),
                        created_at: c.body.created_at.to_rfc3339(),
                    })
                    .collect(),
                failures: engine.failures(&workflow_id),
                workflow_id,
            };
            if ctx.json_output {
                print_json(&output)?;
            } else {
                print_workflow(&output);
            }
        }
    }

    Ok(())
}

fn print_recoverable(recoverable: &[RecoverableWorkflow]) {
    let dim = Style::new().dim();
    println!();
    println!("{}", style("Recoverable Workflows").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    if recoverable.is_empty() {
        println!("  {}", dim.apply_to("None"));
    }
    for workflow in recoverable {
        println!(
            "  {}  {:<24} {}",
            style(&workflow.workflow_id).cyan(),
            workflow.phase.to_string(),
            dim.apply_to(format!(
                "checkpoint #{} {}",
                workflow.sequence,
                workflow.captured_at.format("%Y-%m-%d %H:%M:%S")
            ))
        );
    }
    println!();
}

fn print_workflow(output: &WorkflowOutput) {
    let dim = Style::new().dim();
    println!();
    println!(
        "{} {}",
        style("Workflow").bold(),
        style(&output.workflow_id).cyan()
    );
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {}", dim.apply_to("Checkpoints:"));
    for checkpoint in &output.checkpoints {
        println!(
            "    #{:<3} {}  {}",
            checkpoint.sequence,
            short(&checkpoint.id),
            checkpoint.phase
        );
    }
    if !output.failures.is_empty() {
        println!("  {}", dim.apply_to("Failures:"));
        let red = Style::new().red();
        for failure in &output.failures {
            println!(
                "    {} {:<12} attempt {} -> {}: {}",
                red.apply_to(failure.class),
                failure.stage.as_deref().unwrap_or("-"),
                failure.attempt,
                describe(&failure.action),
                failure.detail
            );
        }
    }
    println!();
}

fn describe(action: &RecoveryAction) -> String {
    match action {
        RecoveryAction::Retry { retry, delay_ms } => format!("retry {} after {}ms", retry, delay_ms),
        RecoveryAction::ReturnToBacklog { reattempt } => format!("backlog (re-attempt {})", reattempt),
        RecoveryAction::Escalate { class } => format!("escalated as {}", class),
        RecoveryAction::Halt => "halted".to_string(),
    }
}
