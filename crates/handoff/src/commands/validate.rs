//! Validate command - check an artifact file without running a workflow.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};
use clap::Args;
use console::{Style, style};
use handoff_pipeline::{SchemaValidator, ValidationResult, seal};
use handoff_types::{Artifact, ArtifactDraft, now};

use super::{Context, print_json};

/// Workflow id given to artifacts validated offline.
const OFFLINE_WORKFLOW: &str = "offline";

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Stage whose output schema and rules apply
    #[arg(short, long)]
    pub stage: String,

    /// Artifact draft (JSON)
    pub file: PathBuf,

    /// Upstream artifact for consistency rules, as STAGE=FILE (repeatable)
    #[arg(long = "prior", value_name = "STAGE=FILE")]
    pub prior: Vec<String>,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_pipeline()?;
    let config = &loaded.config;
    let validator = SchemaValidator::new(config);
    let schema = validator.schema_for_stage(&args.stage)?;

    let prior = args
        .prior
        .iter()
        .map(|spec| {
            let (stage, file) = spec
                .split_once('=')
                .ok_or_else(|| anyhow!("--prior expects STAGE=FILE, got '{}'", spec))?;
            if config.stage(stage).is_none() {
                bail!("unknown stage '{}' in --prior", stage);
            }
            load(Path::new(file), stage, 1)
        })
        .collect::<Result<Vec<Artifact>>>()?;

    let artifact = load(&args.file, &args.stage, schema.version)?;
    let result = validator.validate(&artifact, schema, &prior);
    tracing::debug!(stage = %args.stage, verdict = ?result.verdict, "Validated artifact file");

    if ctx.json_output {
        print_json(&result)?;
    } else {
        print_result(&args.file, &args.stage, &result);
    }

    if !result.is_pass() {
        bail!("validation failed: {}", result.summary());
    }
    Ok(())
}

fn load(path: &Path, stage: &str, default_version: u32) -> Result<Artifact> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let draft = ArtifactDraft::from_json(&text)
        .with_context(|| format!("{} is not an artifact draft", path.display()))?;
    Ok(seal(draft, OFFLINE_WORKFLOW, stage, None, default_version, now())?)
}

fn print_result(path: &Path, stage: &str, result: &ValidationResult) {
    let dim = Style::new().dim();
    let verdict = if result.is_pass() {
        Style::new().green().apply_to("PASS")
    } else {
        Style::new().red().apply_to("FAIL")
    };

    println!();
    println!(
        "{} {} {}",
        style("Validation").bold(),
        path.display(),
        dim.apply_to(format!("(stage {})", stage))
    );
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {}", dim.apply_to("Verdict:"), verdict);
    for violation in &result.violations {
        println!("  {} {}", Style::new().red().apply_to("✗"), violation);
    }
    for rule in result.blocking() {
        println!(
            "  {} {}: {}",
            Style::new().red().apply_to("✗"),
            rule.rule_id,
            rule.detail
        );
    }
    for rule in result.warnings() {
        println!(
            "  {} {}: {}",
            Style::new().yellow().apply_to("⚠"),
            rule.rule_id,
            rule.detail
        );
    }
    println!();
}
