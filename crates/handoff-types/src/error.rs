//! Error types for decoding executor-facing values.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while interpreting executor input or output.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown failure class: {0}")]
    UnknownFailureClass(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
