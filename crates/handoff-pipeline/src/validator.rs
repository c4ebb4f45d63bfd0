//! Schema validation gating every handoff.
//!
//! Validation has two layers. The structural layer checks an artifact
//! against its stage's output schema. The consistency layer evaluates the
//! configured cross-artifact rules against the most recent upstream
//! artifact. Consistency rules only run on structurally sound artifacts.
//!
//! At a handoff the artifact must also satisfy the input schema of the
//! stage that receives it, if that stage declares one. A mismatch is a
//! structural failure of the producing stage.
//!
//! Results are a pure function of their inputs: fields are checked in
//! schema order and rules in configuration order.

use std::collections::BTreeMap;

use handoff_config::{FieldType, HandoffConfig, RuleCheck, RuleConfig, SchemaConfig, Severity};
use handoff_types::Artifact;
use handoff_types::artifact::lookup_path;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Overall outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Why an artifact failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Structural,
    ConsistencyBlocking,
}

/// A structural problem with one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub violation: String,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.violation)
    }
}

/// A failed consistency rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule_id: String,
    pub detail: String,
    pub severity: Severity,
}

/// Outcome of validating one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    #[serde(default)]
    pub violations: Vec<FieldViolation>,
    #[serde(default)]
    pub rule_violations: Vec<RuleViolation>,
}

impl ValidationResult {
    fn from_parts(violations: Vec<FieldViolation>, rule_violations: Vec<RuleViolation>) -> Self {
        let (verdict, reason) = if !violations.is_empty() {
            (Verdict::Fail, Some(ReasonCode::Structural))
        } else if rule_violations
            .iter()
            .any(|r| r.severity == Severity::Blocking)
        {
            (Verdict::Fail, Some(ReasonCode::ConsistencyBlocking))
        } else {
            (Verdict::Pass, None)
        };
        Self {
            verdict,
            reason,
            violations,
            rule_violations,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// PARTIAL rule violations recorded as warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &RuleViolation> {
        self.rule_violations
            .iter()
            .filter(|r| r.severity == Severity::Partial)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &RuleViolation> {
        self.rule_violations
            .iter()
            .filter(|r| r.severity == Severity::Blocking)
    }

    /// Structural violations rendered for an executor's next attempt.
    pub fn violation_lines(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }

    /// Short human-readable summary.
    pub fn summary(&self) -> String {
        match self.reason {
            None if self.rule_violations.is_empty() => "pass".to_string(),
            None => format!("pass with {} warning(s)", self.rule_violations.len()),
            Some(ReasonCode::Structural) => self.violation_lines().join("; "),
            Some(ReasonCode::ConsistencyBlocking) => self
                .blocking()
                .map(|r| format!("{}: {}", r.rule_id, r.detail))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Validates artifacts against the configured schemas and rules.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    schemas: BTreeMap<String, SchemaConfig>,
    stage_schemas: BTreeMap<String, String>,
    input_schemas: BTreeMap<String, String>,
    rules: Vec<RuleConfig>,
}

impl SchemaValidator {
    pub fn new(config: &HandoffConfig) -> Self {
        Self {
            schemas: config.schemas.clone(),
            stage_schemas: config
                .stages
                .iter()
                .map(|s| (s.name.clone(), s.output_schema.clone()))
                .collect(),
            input_schemas: config
                .stages
                .iter()
                .filter_map(|s| Some((s.name.clone(), s.input_schema.clone()?)))
                .collect(),
            rules: config.rules.clone(),
        }
    }

    /// Output schema of a stage.
    pub fn schema_for_stage(&self, stage: &str) -> Result<&SchemaConfig> {
        let name = self
            .stage_schemas
            .get(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))?;
        self.schemas
            .get(name)
            .ok_or_else(|| PipelineError::InvalidWorkflow(format!("stage '{}' references unknown schema '{}'", stage, name)))
    }

    /// Validate an artifact against its stage's output schema and rules.
    pub fn validate_for_stage(&self, artifact: &Artifact, prior: &[Artifact]) -> Result<ValidationResult> {
        let schema = self.schema_for_stage(&artifact.stage)?;
        Ok(self.validate(artifact, schema, prior))
    }

    /// Validate an artifact against an explicit schema. Consistency rules
    /// are those configured for the artifact's stage.
    pub fn validate(&self, artifact: &Artifact, schema: &SchemaConfig, prior: &[Artifact]) -> ValidationResult {
        let violations = check_structure(artifact, schema, true);
        if !violations.is_empty() {
            return ValidationResult::from_parts(violations, Vec::new());
        }

        let rule_violations = self
            .rules
            .iter()
            .filter(|rule| rule.stage == artifact.stage)
            .filter_map(|rule| {
                let upstream = prior.iter().rev().find(|a| a.stage == rule.upstream)?;
                evaluate_rule(rule, upstream, artifact).map(|detail| RuleViolation {
                    rule_id: rule.id.clone(),
                    detail,
                    severity: rule.severity,
                })
            })
            .collect();

        ValidationResult::from_parts(Vec::new(), rule_violations)
    }

    /// [`validate`](Self::validate), then check a passing artifact against
    /// the input schema of `consumer`, the stage it is handed to.
    pub fn validate_handoff(
        &self,
        artifact: &Artifact,
        schema: &SchemaConfig,
        prior: &[Artifact],
        consumer: Option<&str>,
    ) -> ValidationResult {
        let result = self.validate(artifact, schema, prior);
        let Some(consumer) = consumer else {
            return result;
        };
        if !result.is_pass() {
            return result;
        }
        let violations = self.check_input(artifact, consumer);
        if violations.is_empty() {
            result
        } else {
            ValidationResult::from_parts(violations, result.rule_violations)
        }
    }

    /// Violations of `consumer`'s input schema. Empty when the stage
    /// declares none.
    pub fn check_input(&self, artifact: &Artifact, consumer: &str) -> Vec<FieldViolation> {
        let Some(schema) = self
            .input_schemas
            .get(consumer)
            .and_then(|name| self.schemas.get(name))
        else {
            return Vec::new();
        };
        // Input schemas version independently of the producer's output.
        check_structure(artifact, schema, false)
            .into_iter()
            .map(|v| FieldViolation {
                violation: format!("{} (input of '{}')", v.violation, consumer),
                field: v.field,
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Structural checks
// ─────────────────────────────────────────────────────────────────────────────

fn check_structure(artifact: &Artifact, schema: &SchemaConfig, check_version: bool) -> Vec<FieldViolation> {
    let mut violations = Vec::new();

    if artifact.artifact_type != schema.artifact_type {
        violations.push(FieldViolation {
            field: "artifact_type".to_string(),
            violation: format!(
                "expected '{}', found '{}'",
                schema.artifact_type, artifact.artifact_type
            ),
        });
    }

    if check_version && artifact.schema_version != schema.version {
        violations.push(FieldViolation {
            field: "schema_version".to_string(),
            violation: format!(
                "expected version {}, found {}",
                schema.version, artifact.schema_version
            ),
        });
    }

    if !artifact.payload.is_object() {
        violations.push(FieldViolation {
            field: "payload".to_string(),
            violation: format!("expected object, found {}", type_name(&artifact.payload)),
        });
        return violations;
    }

    for field in &schema.fields {
        match lookup_path(&artifact.payload, &field.name) {
            None | Some(Value::Null) if !field.required => {}
            None => violations.push(FieldViolation {
                field: field.name.clone(),
                violation: "missing required field".to_string(),
            }),
            Some(value) if !matches_type(value, field.field_type) => {
                violations.push(FieldViolation {
                    field: field.name.clone(),
                    violation: format!(
                        "expected {}, found {}",
                        field.field_type.as_str(),
                        type_name(value)
                    ),
                })
            }
            Some(_) => {}
        }
    }

    violations
}

fn matches_type(value: &Value, expected: FieldType) -> bool {
    match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array => value.is_array(),
        FieldType::Object => value.is_object(),
        FieldType::Any => !value.is_null(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Consistency rules
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the violation detail, or `None` if the rule holds.
fn evaluate_rule(rule: &RuleConfig, upstream: &Artifact, downstream: &Artifact) -> Option<String> {
    match &rule.check {
        RuleCheck::KeywordCoverage {
            upstream_field,
            downstream_fields,
            case_insensitive,
        } => {
            let keywords = strings_at(upstream, upstream_field)?;
            let fold = |s: &str| {
                if *case_insensitive {
                    s.to_lowercase()
                } else {
                    s.to_string()
                }
            };
            let texts: Vec<String> = downstream_fields
                .iter()
                .filter_map(|f| downstream.field(f))
                .flat_map(collect_strings)
                .map(|s| fold(&s))
                .collect();
            let missing: Vec<String> = keywords
                .into_iter()
                .filter(|k| {
                    let needle = fold(k);
                    !texts.iter().any(|t| t.contains(&needle))
                })
                .collect();
            if missing.is_empty() {
                None
            } else {
                Some(format!(
                    "keywords from {}.{} not carried into {}: {}",
                    rule.upstream,
                    upstream_field,
                    downstream_fields.join(", "),
                    missing.join(", ")
                ))
            }
        }
        RuleCheck::FieldEquals {
            upstream_field,
            downstream_field,
        } => {
            let expected = upstream.field(upstream_field)?;
            match downstream.field(downstream_field) {
                Some(actual) if actual == expected => None,
                Some(actual) => Some(format!(
                    "{} is {} but {}.{} is {}",
                    downstream_field, actual, rule.upstream, upstream_field, expected
                )),
                None => Some(format!("{} is missing", downstream_field)),
            }
        }
        RuleCheck::CountAtLeast {
            upstream_field,
            downstream_field,
        } => {
            let expected = upstream.field(upstream_field)?.as_array()?.len();
            match downstream.field(downstream_field).and_then(Value::as_array) {
                Some(items) if items.len() >= expected => None,
                Some(items) => Some(format!(
                    "{} has {} entries, expected at least {}",
                    downstream_field,
                    items.len(),
                    expected
                )),
                None => Some(format!("{} is missing or not an array", downstream_field)),
            }
        }
        RuleCheck::SubsetOf {
            upstream_field,
            downstream_field,
        } => {
            let allowed = upstream.field(upstream_field)?.as_array()?;
            match downstream.field(downstream_field).and_then(Value::as_array) {
                Some(items) => {
                    let extra: Vec<String> = items
                        .iter()
                        .filter(|item| !allowed.contains(item))
                        .map(ToString::to_string)
                        .collect();
                    if extra.is_empty() {
                        None
                    } else {
                        Some(format!(
                            "{} contains values not in {}.{}: {}",
                            downstream_field,
                            rule.upstream,
                            upstream_field,
                            extra.join(", ")
                        ))
                    }
                }
                None => Some(format!("{} is missing or not an array", downstream_field)),
            }
        }
    }
}

fn strings_at(artifact: &Artifact, path: &str) -> Option<Vec<String>> {
    artifact.field(path).map(collect_strings)
}

fn collect_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
