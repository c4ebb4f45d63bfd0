//! Run command - submit a workflow and drive it to completion.

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use handoff_pipeline::{DriveReport, Driver, Engine, ExecutorRegistry, Phase};
use handoff_types::{Artifact, DecisionRequest, EngineEvent, EventKind, Id};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use super::{Context, print_json, short};

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stages to run, in pipeline order (default: every configured stage)
    #[arg(short, long, value_delimiter = ',')]
    pub stages: Vec<String>,

    /// Admission priority; higher runs first
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i32,
}

/// Final result of a drive, for JSON output.
#[derive(Debug, Serialize)]
struct RunOutput {
    workflow_id: Id,
    phase: Phase,
    report: DriveReport,
    events: Vec<EngineEvent>,
    artifacts: Vec<ArtifactSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_decision: Option<DecisionRequest>,
}

#[derive(Debug, Serialize)]
struct ArtifactSummary {
    id: String,
    artifact_type: String,
    stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    work_item: Option<String>,
}

impl From<&Artifact> for ArtifactSummary {
    fn from(artifact: &Artifact) -> Self {
        Self {
            id: artifact.id.clone(),
            artifact_type: artifact.artifact_type.clone(),
            stage: artifact.stage.clone(),
            work_item: artifact.work_item.clone(),
        }
    }
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_pipeline()?;
    let registry = ExecutorRegistry::from_config(&loaded.config);
    let missing = registry.missing(&loaded.config);
    let stages = (!args.stages.is_empty()).then_some(args.stages);
    let selected = stages.clone().unwrap_or_else(|| loaded.config.stage_names());
    if let Some(stage) = selected.iter().find(|s| missing.contains(s)) {
        bail!("stage '{}' has no command configured", stage);
    }

    let engine = ctx.open_engine(&loaded)?;
    let workflow_id = engine.submit(stages, args.priority)?;
    tracing::info!(workflow_id = %workflow_id, "Workflow submitted");

    if !ctx.json_output {
        println!();
        println!(
            "{} {}",
            style("Workflow").bold(),
            style(&workflow_id).cyan()
        );
        println!("{}", Style::new().dim().apply_to("─".repeat(40)));
    }

    drive(engine, registry, &workflow_id, ctx).await
}

/// Drive one workflow, streaming events, and print the result.
///
/// Shared by `run` and `resume`. Ctrl-C stops the drive and captures a
/// checkpoint so the workflow can be resumed later.
pub(super) async fn drive(
    engine: Arc<Engine>,
    registry: ExecutorRegistry,
    workflow_id: &str,
    ctx: &Context,
) -> Result<()> {
    let start_seq = engine.recent_events().last().map(|e| e.seq).unwrap_or(0);
    let printer = (!ctx.json_output).then(|| spawn_printer(engine.subscribe(), workflow_id));

    let driver = Driver::new(engine.clone(), registry);
    let result = tokio::select! {
        report = driver.run(Some(workflow_id)) => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };

    if let Some((stop, handle)) = printer {
        let _ = stop.send(());
        let _ = handle.await;
    }

    let Some(report) = result else {
        let phase = engine.phase(workflow_id)?;
        if !phase.is_terminal() && !phase.is_paused() {
            let checkpoint = engine.capture(workflow_id)?;
            eprintln!(
                "Interrupted. Resume with: handoff resume {} --checkpoint {}",
                workflow_id, checkpoint
            );
        } else {
            eprintln!("Interrupted.");
        }
        bail!("interrupted");
    };
    let report = report?;

    let phase = engine.phase(workflow_id)?;
    let view = engine.workflow(workflow_id)?;
    let artifacts = engine.artifacts_for_workflow(workflow_id)?;

    if ctx.json_output {
        let events = engine
            .events_since(start_seq)
            .into_iter()
            .filter(|e| e.workflow_id == workflow_id)
            .collect();
        print_json(&RunOutput {
            workflow_id: workflow_id.to_string(),
            phase: phase.clone(),
            report: report.clone(),
            events,
            artifacts: artifacts.iter().map(ArtifactSummary::from).collect(),
            pending_decision: view.pending_decision,
        })?;
    } else {
        print_summary(&phase, &report, &artifacts, view.pending_decision.as_ref(), workflow_id);
    }

    match phase {
        Phase::Complete => Ok(()),
        Phase::Paused { .. } => bail!("workflow {} is paused awaiting a decision", workflow_id),
        Phase::Halted { .. } => bail!("workflow {} halted", workflow_id),
        Phase::Cancelled => bail!("workflow {} was cancelled", workflow_id),
        _ if !report.stalled.is_empty() => {
            bail!("stages without a command: {}", report.stalled.join(", "))
        }
        other => bail!("workflow {} stopped at {}", workflow_id, other),
    }
}

/// Print the workflow's events as they happen until told to stop.
fn spawn_printer(
    mut events: broadcast::Receiver<EngineEvent>,
    workflow_id: &str,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let (stop, mut stopped) = oneshot::channel::<()>();
    let workflow_id = workflow_id.to_string();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) if event.workflow_id == workflow_id => print_event(&event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = &mut stopped => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            if event.workflow_id == workflow_id {
                print_event(&event);
            }
        }
    });
    (stop, handle)
}

fn print_event(event: &EngineEvent) {
    let style = match event.kind {
        EventKind::Completed | EventKind::Recovered => Style::new().green(),
        EventKind::Delayed => Style::new().yellow(),
        EventKind::Failed | EventKind::Inconsistent => Style::new().red(),
    };
    let stage = event.stage.as_deref().unwrap_or("-");
    println!(
        "  {} {:<12} {}",
        style.apply_to(format!("{:<12}", event.kind.to_string())),
        stage,
        event.detail
    );
}

fn print_summary(
    phase: &Phase,
    report: &DriveReport,
    artifacts: &[Artifact],
    pending: Option<&DecisionRequest>,
    workflow_id: &str,
) {
    let dim = Style::new().dim();
    let phase_style = match phase {
        Phase::Complete => Style::new().green(),
        Phase::Paused { .. } => Style::new().yellow(),
        _ => Style::new().red(),
    };

    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {}", dim.apply_to("Phase:"), phase_style.apply_to(phase));
    println!(
        "  {} {} executed, {} accepted, {} retried, {} returned",
        dim.apply_to("Attempts:"),
        report.executed,
        report.accepted,
        report.retried,
        report.returned
    );
    if !artifacts.is_empty() {
        println!("  {}", dim.apply_to("Artifacts:"));
        for artifact in artifacts {
            let item = artifact
                .work_item
                .as_deref()
                .map(|i| format!(" ({})", i))
                .unwrap_or_default();
            println!(
                "    {}  {:<12} {}{}",
                short(&artifact.id),
                artifact.stage,
                artifact.artifact_type,
                item
            );
        }
    }
    if !report.stalled.is_empty() {
        println!(
            "  {} {}",
            dim.apply_to("Stalled:"),
            report.stalled.join(", ")
        );
    }
    if let Some(request) = pending {
        println!();
        println!("{}", style("Decision required").yellow().bold());
        println!("  {} {}", dim.apply_to("Class:"), request.failure_class);
        if let Some(ref stage) = request.stage {
            println!("  {} {}", dim.apply_to("Stage:"), stage);
        }
        println!("  {} {}", dim.apply_to("Detail:"), request.detail);
        let options: Vec<String> = request.options.iter().map(ToString::to_string).collect();
        println!("  {} {}", dim.apply_to("Options:"), options.join(", "));
        println!();
        println!(
            "  {}",
            dim.apply_to(format!("Fix the stage, then: handoff resume {}", workflow_id))
        );
    }
    println!();
}
