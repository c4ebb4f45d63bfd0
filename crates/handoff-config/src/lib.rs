//! Configuration system for the Handoff pipeline engine.
//!
//! Provides TOML-based configuration with:
//! - Ordered stages, each Kanban or Scrum, with WIP limits and executor commands
//! - Structural artifact schemas and cross-artifact consistency rules
//! - Retry, sprint, gate and validation policies with defaults
//! - Config file layering (XDG user config + project-local `handoff.toml`)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, PROJECT_CONFIG_FILE, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
