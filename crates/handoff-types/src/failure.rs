//! Failure taxonomy shared by executors and the recovery controller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Classification of a stage failure.
///
/// The class decides how the engine responds: transient failures are retried
/// with backoff, format errors go back to the stage's backlog, and the rest
/// pause or halt the workflow pending a coordinator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    /// Executor timeout, rate limit, I/O error.
    Transient,
    /// The artifact failed structural validation.
    FormatError,
    /// A blocking consistency rule failed.
    ConsistencyError,
    /// The executor reported it cannot complete the work.
    AgentError,
    /// Unrecoverable infrastructure fault.
    Critical,
}

impl FailureClass {
    /// Canonical wire name (`TRANSIENT`, `FORMAT_ERROR`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "TRANSIENT",
            FailureClass::FormatError => "FORMAT_ERROR",
            FailureClass::ConsistencyError => "CONSISTENCY_ERROR",
            FailureClass::AgentError => "AGENT_ERROR",
            FailureClass::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "TRANSIENT" => Ok(FailureClass::Transient),
            "FORMAT_ERROR" | "FORMAT" => Ok(FailureClass::FormatError),
            "CONSISTENCY_ERROR" | "CONSISTENCY" => Ok(FailureClass::ConsistencyError),
            "AGENT_ERROR" | "AGENT" => Ok(FailureClass::AgentError),
            "CRITICAL" => Ok(FailureClass::Critical),
            other => Err(Error::UnknownFailureClass(other.to_string())),
        }
    }
}

/// A failure reported by a stage executor instead of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub class: FailureClass,
    pub detail: String,
}

impl StageFailure {
    pub fn new(class: FailureClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, detail)
    }

    pub fn agent(detail: impl Into<String>) -> Self {
        Self::new(FailureClass::AgentError, detail)
    }

    pub fn critical(detail: impl Into<String>) -> Self {
        Self::new(FailureClass::Critical, detail)
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.detail)
    }
}

impl std::error::Error for StageFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_class_serde_names() {
        let json = serde_json::to_string(&FailureClass::FormatError).unwrap();
        assert_eq!(json, "\"FORMAT_ERROR\"");
        let back: FailureClass = serde_json::from_str("\"AGENT_ERROR\"").unwrap();
        assert_eq!(back, FailureClass::AgentError);
    }

    #[test]
    fn test_failure_class_from_str_lenient() {
        assert_eq!(
            "transient".parse::<FailureClass>().unwrap(),
            FailureClass::Transient
        );
        assert_eq!(
            "consistency-error".parse::<FailureClass>().unwrap(),
            FailureClass::ConsistencyError
        );
        assert!("boom".parse::<FailureClass>().is_err());
    }

    #[test]
    fn test_stage_failure_display() {
        let f = StageFailure::transient("rate limited");
        assert_eq!(f.to_string(), "TRANSIENT: rate limited");
    }
}
