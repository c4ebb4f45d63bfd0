//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to write a config file.
    #[error("failed to write config file '{path}': {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize config.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A stage name was referenced but never defined.
    #[error("stage '{name}' not found (referenced by {context})")]
    UnknownStage { name: String, context: String },

    /// A schema name was referenced but never defined.
    #[error("schema '{name}' not found (referenced by {context})")]
    UnknownSchema { name: String, context: String },

    /// The configuration is structurally valid TOML but semantically wrong.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
