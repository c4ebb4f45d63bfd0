//! CLI command handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use handoff_config::LoadedConfig;
use handoff_pipeline::Engine;

pub mod artifact;
pub mod config;
pub mod resume;
pub mod run;
pub mod status;
pub mod validate;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// User config directory override.
    pub config_dir: Option<PathBuf>,
    /// Explicit pipeline config file.
    pub config_file: Option<PathBuf>,
    /// State directory override.
    pub state_dir: Option<PathBuf>,
}

impl Context {
    /// Discover and merge the config layers.
    pub fn load_config(&self) -> Result<LoadedConfig> {
        let loaded = handoff_config::load_config_with_options(
            None,
            self.config_dir.as_deref(),
            self.config_file.as_deref(),
        )?;
        Ok(loaded)
    }

    /// Like [`load_config`](Self::load_config), but also rejects an
    /// inconsistent pipeline and surfaces loader warnings.
    pub fn load_pipeline(&self) -> Result<LoadedConfig> {
        let loaded = self.load_config()?;
        for warning in &loaded.warnings {
            tracing::warn!("{}", warning);
        }
        loaded
            .config
            .validate()
            .context("pipeline configuration is invalid")?;
        Ok(loaded)
    }

    pub fn user_config_dir(&self) -> Option<PathBuf> {
        self.config_dir
            .clone()
            .or_else(handoff_config::xdg_config_dir)
    }

    /// `--state-dir`, else the engine section of the loaded config.
    pub fn state_dir(&self, loaded: &LoadedConfig) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| loaded.config.engine().effective_state_dir())
    }

    /// Open the persistent engine for the loaded pipeline.
    pub fn open_engine(&self, loaded: &LoadedConfig) -> Result<Arc<Engine>> {
        let dir = self.state_dir(loaded);
        let engine = Engine::open(loaded.config.clone(), &dir)
            .with_context(|| format!("failed to open state directory {}", dir.display()))?;
        tracing::debug!(state_dir = %dir.display(), "Engine opened");
        Ok(Arc::new(engine))
    }
}

/// First 12 characters of an id, for display.
pub fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Print a value as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Display form of a path relative to the working directory when possible.
pub fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(cwd).ok().map(Path::to_path_buf))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}
