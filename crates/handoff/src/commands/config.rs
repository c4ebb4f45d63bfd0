//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use console::Style;
use handoff_config::{PROJECT_CONFIG_FILE, ProcessMode};
use serde::Serialize;

use super::{Context, display_path, print_json};

/// Starter pipeline written by `config init`.
const STARTER_PIPELINE: &str = r#"# Handoff pipeline definition.
#
# Kanban stages run in order under WIP limits. Their artifacts are then
# split into work items, packed into sprints and run through the Scrum
# stages one item at a time. Each stage command reads its input as JSON on
# stdin and prints an artifact draft as JSON on stdout.

[sprint]
capacity_points = 20

[[stages]]
name = "spike"
output_schema = "findings"
command = "./stages/spike.sh"

[[stages]]
name = "plan"
output_schema = "plan"
command = "./stages/plan.sh"

[[stages]]
name = "build"
mode = "scrum"
output_schema = "change"
command = "./stages/build.sh"
timeout_secs = 600

[schemas.findings]
artifact_type = "findings"
[[schemas.findings.fields]]
name = "summary"
type = "string"
[[schemas.findings.fields]]
name = "keywords"
type = "array"

[schemas.plan]
artifact_type = "plan"
[[schemas.plan.fields]]
name = "summary"
type = "string"
[[schemas.plan.fields]]
name = "work_items"
type = "array"

[schemas.change]
artifact_type = "change"
[[schemas.change.fields]]
name = "summary"
type = "string"

[[rules]]
id = "plan-covers-findings"
stage = "plan"
upstream = "spike"
severity = "partial"
[rules.check]
kind = "keyword_coverage"
upstream_field = "keywords"
downstream_fields = ["summary"]
case_insensitive = true
"#;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved pipeline
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Check the pipeline for errors
    Validate,

    /// Write a starter ./handoff.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Validate => cmd_validate(ctx),
        ConfigCommand::Init { force } => cmd_init(force),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let config = &loaded.config;

    if ctx.json_output {
        return print_json(config);
    }

    println!("# Handoff Configuration\n");

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", display_path(source));
        }
        println!();
    }

    if config.stages.is_empty() {
        println!("No stages configured\n");
    } else {
        println!("Stages:");
        for stage in &config.stages {
            let mode = match stage.mode {
                ProcessMode::Kanban => "kanban",
                ProcessMode::Scrum => "scrum",
            };
            let wip = stage
                .effective_wip_limit()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "∞".to_string());
            println!(
                "  {:<12} {:<7} wip {:<3} -> {:<16} {}",
                stage.name,
                mode,
                wip,
                stage.output_schema,
                stage.command.as_deref().unwrap_or("(no command)")
            );
        }
        println!();
    }

    let sprint = config.sprint();
    let retry = config.retry();
    println!("Sprint: {} points per sprint", sprint.capacity_points);
    println!(
        "Retry:  {} retries, delays {:?} ms",
        retry.max_retries, retry.delays_ms
    );
    println!(
        "State:  {}",
        display_path(&ctx.state_dir(&loaded))
    );
    println!();

    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        if let Ok(toml_str) = config.to_toml() {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;

    println!("Config file search order (later overrides earlier):\n");

    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'handoff config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct ValidateOutput {
    valid: bool,
    stages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    warnings: Vec<String>,
}

fn cmd_validate(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let result = loaded.config.validate();

    if ctx.json_output {
        print_json(&ValidateOutput {
            valid: result.is_ok(),
            stages: loaded.config.stages.len(),
            error: result.as_ref().err().map(ToString::to_string),
            warnings: loaded.warnings.clone(),
        })?;
    } else {
        let dim = Style::new().dim();
        match &result {
            Ok(()) => println!(
                "{} {} stage(s)",
                Style::new().green().apply_to("✓ valid"),
                loaded.config.stages.len()
            ),
            Err(e) => println!("{} {}", Style::new().red().apply_to("✗ invalid:"), e),
        }
        for w in &loaded.warnings {
            println!("  {} {}", dim.apply_to("⚠"), w);
        }
    }

    result.map_err(Into::into)
}

fn cmd_init(force: bool) -> Result<()> {
    let path = PathBuf::from(PROJECT_CONFIG_FILE);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(&path, STARTER_PIPELINE)?;
    println!("✓ Wrote {}", path.display());
    println!("  Point each stage's command at a script, then run 'handoff run'.");
    Ok(())
}
