//! Artifact envelopes exchanged between stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Id, Result, Timestamp};

/// Content-derived artifact identifier (hex SHA-256 of the canonical content).
pub type ArtifactId = String;

/// A stored, validated stage output.
///
/// Artifacts are immutable once stored. Downstream stages reference them by
/// id; the payload is never copied into another artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub artifact_type: String,
    pub workflow_id: Id,
    /// Stage that produced this artifact.
    pub stage: String,
    /// Work item this artifact belongs to (Scrum stages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item: Option<String>,
    pub payload: Value,
    pub content_hash: String,
    /// Provenance: artifacts this one was derived from.
    #[serde(default)]
    pub depends_on: Vec<ArtifactId>,
    pub schema_version: u32,
    pub created_at: Timestamp,
}

impl Artifact {
    /// Look up a payload field by dotted path (`search.keywords`).
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.payload, path)
    }
}

/// What an executor hands back: the artifact before the engine has
/// addressed, validated, and stored it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub artifact_type: String,
    pub payload: Value,
    /// Declared dependencies. When empty, the engine records the
    /// assignment's input artifacts as the provenance.
    #[serde(default)]
    pub depends_on: Vec<ArtifactId>,
    /// Schema version the executor produced against, if it declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

impl ArtifactDraft {
    /// Create a draft with no declared dependencies.
    pub fn new(artifact_type: impl Into<String>, payload: Value) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            payload,
            depends_on: Vec::new(),
            schema_version: None,
        }
    }

    /// Declare a dependency on an existing artifact.
    pub fn with_dependency(mut self, id: impl Into<ArtifactId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Declare the schema version this draft was produced against.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Parse a draft from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Look up a payload field by dotted path.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.payload, path)
    }
}

/// Resolve a dotted path against a JSON value. Numeric segments index arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_path() {
        let payload = json!({"search": {"keywords": ["rust", "tokio"]}});
        let found = lookup_path(&payload, "search.keywords").unwrap();
        assert_eq!(found, &json!(["rust", "tokio"]));
    }

    #[test]
    fn test_lookup_array_index() {
        let payload = json!({"items": [{"title": "a"}, {"title": "b"}]});
        assert_eq!(lookup_path(&payload, "items.1.title"), Some(&json!("b")));
        assert_eq!(lookup_path(&payload, "items.9.title"), None);
    }

    #[test]
    fn test_lookup_missing() {
        let payload = json!({"a": 1});
        assert!(lookup_path(&payload, "a.b").is_none());
        assert!(lookup_path(&payload, "z").is_none());
    }

    #[test]
    fn test_draft_from_json_defaults() {
        let draft =
            ArtifactDraft::from_json(r#"{"artifact_type": "spike", "payload": {"x": 1}}"#).unwrap();
        assert_eq!(draft.artifact_type, "spike");
        assert!(draft.depends_on.is_empty());
        assert!(draft.schema_version.is_none());
    }

    #[test]
    fn test_draft_from_json_rejects_garbage() {
        assert!(ArtifactDraft::from_json("not json").is_err());
    }
}
