//! Artifact command - show a stored artifact and where it came from.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use handoff_pipeline::{ArtifactStore, FsArtifactStore, ProvenanceRecord};
use handoff_types::Artifact;
use serde::Serialize;

use super::{Context, print_json, short};

/// Arguments for the artifact command.
#[derive(Args, Debug)]
pub struct ArtifactArgs {
    /// Artifact id (content hash)
    pub id: String,
}

#[derive(Debug, Serialize)]
struct ArtifactOutput {
    artifact: Artifact,
    provenance: ProvenanceRecord,
}

/// Run the artifact command.
pub async fn run(args: ArtifactArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let store = FsArtifactStore::open(ctx.state_dir(&loaded))?;
    let artifact = store.get(&args.id)?;
    let provenance = store.provenance(&args.id)?;

    if ctx.json_output {
        return print_json(&ArtifactOutput {
            artifact,
            provenance,
        });
    }

    let dim = Style::new().dim();
    println!();
    println!(
        "{} {}",
        style("Artifact").bold(),
        style(short(&artifact.id)).cyan()
    );
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {}", dim.apply_to("Type:"), artifact.artifact_type);
    println!("  {} {}", dim.apply_to("Workflow:"), artifact.workflow_id);
    println!("  {} {}", dim.apply_to("Stage:"), artifact.stage);
    if let Some(ref item) = artifact.work_item {
        println!("  {} {}", dim.apply_to("Work item:"), item);
    }
    println!("  {} {}", dim.apply_to("Schema:"), artifact.schema_version);
    println!(
        "  {} {}",
        dim.apply_to("Created:"),
        artifact.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if !provenance.depends_on.is_empty() {
        println!("  {}", dim.apply_to("Depends on:"));
        for id in &provenance.depends_on {
            println!("    {}", short(id));
        }
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&artifact.payload)?);
    println!();
    Ok(())
}
