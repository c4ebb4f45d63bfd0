//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [engine]
//! state_dir = "/var/lib/handoff"
//!
//! [retry]
//! delays_ms = [1000, 5000, 15000]
//! max_retries = 3
//!
//! [[stages]]
//! name = "spike"
//! mode = "kanban"
//! wip_limit = 2
//! output_schema = "spike_report"
//!
//! [schemas.spike_report]
//! artifact_type = "spike_report"
//! fields = [{ name = "keywords", type = "array" }]
//!
//! [[rules]]
//! id = "keywords-carried"
//! stage = "spy"
//! upstream = "spike"
//! severity = "blocking"
//! check = { kind = "keyword_coverage", upstream_field = "keywords", downstream_fields = ["search.query"] }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged. Accessors return defaults for
/// sections that were never set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Engine and persistence settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSection>,

    /// Transient retry / format re-attempt policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,

    /// Consistency warning policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSection>,

    /// Sprint sizing for Scrum-mode stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sprint: Option<SprintSection>,

    /// How the transition gate turns Kanban artifacts into work items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSection>,

    /// Log file settings for the CLI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingSection>,

    /// Ordered pipeline stages.
    pub stages: Vec<StageConfig>,

    /// Artifact schemas keyed by name.
    pub schemas: BTreeMap<String, SchemaConfig>,

    /// Cross-artifact consistency rules.
    pub rules: Vec<RuleConfig>,
}

impl HandoffConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale. Stages and schemas merge by name and
    /// rules by id; a stage redefined in `other` keeps its original position.
    pub fn merge(&mut self, other: HandoffConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }

        if other.retry.is_some() {
            self.retry = other.retry;
        }

        if other.validation.is_some() {
            self.validation = other.validation;
        }

        if other.sprint.is_some() {
            self.sprint = other.sprint;
        }

        if other.gate.is_some() {
            self.gate = other.gate;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }

        for stage in other.stages {
            match self.stages.iter_mut().find(|s| s.name == stage.name) {
                Some(existing) => *existing = stage,
                None => self.stages.push(stage),
            }
        }

        for (name, schema) in other.schemas {
            self.schemas.insert(name, schema);
        }

        for rule in other.rules {
            match self.rules.iter_mut().find(|r| r.id == rule.id) {
                Some(existing) => *existing = rule,
                None => self.rules.push(rule),
            }
        }
    }

    /// Effective engine section.
    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    /// Effective retry section.
    pub fn retry(&self) -> RetrySection {
        self.retry.clone().unwrap_or_default()
    }

    /// Effective validation section.
    pub fn validation(&self) -> ValidationSection {
        self.validation.clone().unwrap_or_default()
    }

    /// Effective sprint section.
    pub fn sprint(&self) -> SprintSection {
        self.sprint.clone().unwrap_or_default()
    }

    /// Effective gate section.
    pub fn gate(&self) -> GateSection {
        self.gate.clone().unwrap_or_default()
    }

    /// Effective logging section.
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in pipeline order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Position of a stage in the pipeline.
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Look up a schema by name.
    pub fn schema(&self, name: &str) -> Option<&SchemaConfig> {
        self.schemas.get(name)
    }

    /// Consistency rules that apply to artifacts produced by `stage`.
    pub fn rules_for(&self, stage: &str) -> Vec<&RuleConfig> {
        self.rules.iter().filter(|r| r.stage == stage).collect()
    }

    /// Validate cross-references and ordering constraints.
    ///
    /// Checks:
    /// - At least one stage, with unique non-empty names
    /// - Kanban stages precede Scrum stages
    /// - WIP limits are at least 1 where set
    /// - Schema references resolve
    /// - Rule ids are unique and rule stages resolve, upstream before downstream
    /// - Retry and sprint policies are usable
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[stages]] entry is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut scrum_seen = false;
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stage name cannot be empty".into()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            match stage.mode {
                ProcessMode::Scrum => scrum_seen = true,
                ProcessMode::Kanban if scrum_seen => {
                    return Err(ConfigError::Invalid(format!(
                        "kanban stage '{}' follows a scrum stage; kanban stages must come first",
                        stage.name
                    )));
                }
                ProcessMode::Kanban => {}
            }
            if stage.wip_limit == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' has wip_limit = 0",
                    stage.name
                )));
            }
            if !self.schemas.contains_key(&stage.output_schema) {
                return Err(ConfigError::UnknownSchema {
                    name: stage.output_schema.clone(),
                    context: format!("stage '{}' output_schema", stage.name),
                });
            }
            if let Some(ref input) = stage.input_schema
                && !self.schemas.contains_key(input)
            {
                return Err(ConfigError::UnknownSchema {
                    name: input.clone(),
                    context: format!("stage '{}' input_schema", stage.name),
                });
            }
        }

        for (name, schema) in &self.schemas {
            let mut fields = HashSet::new();
            for field in &schema.fields {
                if field.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "schema '{}' has a field with an empty name",
                        name
                    )));
                }
                if !fields.insert(field.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "schema '{}' declares field '{}' twice",
                        name, field.name
                    )));
                }
            }
        }

        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate rule id: {}",
                    rule.id
                )));
            }
            let downstream =
                self.stage_index(&rule.stage)
                    .ok_or_else(|| ConfigError::UnknownStage {
                        name: rule.stage.clone(),
                        context: format!("rule '{}'", rule.id),
                    })?;
            let upstream =
                self.stage_index(&rule.upstream)
                    .ok_or_else(|| ConfigError::UnknownStage {
                        name: rule.upstream.clone(),
                        context: format!("rule '{}' upstream", rule.id),
                    })?;
            if upstream >= downstream {
                return Err(ConfigError::Invalid(format!(
                    "rule '{}': upstream stage '{}' must come before '{}'",
                    rule.id, rule.upstream, rule.stage
                )));
            }
            if let RuleCheck::KeywordCoverage {
                ref downstream_fields,
                ..
            } = rule.check
                && downstream_fields.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "rule '{}': keyword_coverage needs at least one downstream field",
                    rule.id
                )));
            }
        }

        let retry = self.retry();
        if retry.max_retries > 0 && retry.delays_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "retry.delays_ms cannot be empty when max_retries > 0".into(),
            ));
        }

        if self.sprint().capacity_points == 0 {
            return Err(ConfigError::Invalid(
                "sprint.capacity_points must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "HANDOFF_STATE_DIR";

/// Engine and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Directory for artifacts, checkpoints, and the audit log.
    pub state_dir: Option<PathBuf>,
    /// Number of recent events kept for polling observers.
    pub event_buffer: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            state_dir: None,
            event_buffer: 256,
        }
    }
}

impl EngineSection {
    /// Get the effective state directory, checking the environment first.
    ///
    /// Resolution order:
    /// 1. `HANDOFF_STATE_DIR` environment variable
    /// 2. Configured `state_dir`
    /// 3. Platform data dir (`~/.local/share/handoff` on Linux)
    pub fn effective_state_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("handoff"))
                .unwrap_or_else(|| PathBuf::from(".handoff"))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policies
// ─────────────────────────────────────────────────────────────────────────────

/// Retry policy for transient failures and format re-attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Backoff delays in milliseconds, one per retry. When `max_retries`
    /// exceeds the list, the last delay repeats.
    pub delays_ms: Vec<u64>,
    /// Maximum number of retries before escalating as an agent error.
    pub max_retries: u32,
    /// Automatic re-attempts after a structural validation failure.
    pub format_reattempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            delays_ms: vec![1_000, 5_000, 15_000],
            max_retries: 3,
            format_reattempts: 1,
        }
    }
}

impl RetrySection {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) - 1) as usize;
        let ms = self
            .delays_ms
            .get(idx)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

/// Consistency warning policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    /// Once a workflow has accumulated this many PARTIAL warnings, further
    /// PARTIAL violations block. Unset means warnings never escalate.
    pub escalate_partial_after: Option<u32>,
}

/// Sprint sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SprintSection {
    /// Committed point capacity per sprint.
    pub capacity_points: u32,
    /// Estimate given to items that do not carry one.
    pub default_estimate: u32,
}

impl Default for SprintSection {
    fn default() -> Self {
        Self {
            capacity_points: 20,
            default_estimate: 1,
        }
    }
}

/// Field names the transition gate reads from Kanban artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    /// Array-of-objects field holding work items.
    pub items_field: String,
    pub id_field: String,
    pub title_field: String,
    pub estimate_field: String,
    pub criteria_field: String,
    /// Only artifacts of this type feed the gate. Unset means all Kanban
    /// artifacts do.
    pub source_type: Option<String>,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            items_field: "work_items".to_string(),
            id_field: "id".to_string(),
            title_field: "title".to_string(),
            estimate_field: "estimate".to_string(),
            criteria_field: "acceptance_criteria".to_string(),
            source_type: None,
        }
    }
}

/// Log file settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Write a JSON log file in addition to console output.
    pub file: bool,
    /// Directory for log files. Defaults to `<config dir>/logs`.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file: true,
            directory: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stages
// ─────────────────────────────────────────────────────────────────────────────

/// Scheduling discipline for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Continuous flow bounded by a WIP limit.
    #[default]
    Kanban,
    /// Batched into committed sprints.
    Scrum,
}

/// A pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    #[serde(default)]
    pub mode: ProcessMode,

    /// Maximum concurrent in-progress assignments. Kanban stages default
    /// to 1; Scrum stages are unbounded unless set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<usize>,

    /// Schema an artifact handed to this stage must also satisfy. Checked
    /// when the previous stage's artifact is validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<String>,

    /// Schema the stage's output artifact must satisfy.
    pub output_schema: String,

    /// Shell command run by the CLI's command executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Command timeout in seconds; a timeout is a transient failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StageConfig {
    /// Create a Kanban stage.
    pub fn kanban(name: impl Into<String>, output_schema: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: ProcessMode::Kanban,
            wip_limit: None,
            input_schema: None,
            output_schema: output_schema.into(),
            command: None,
            timeout_secs: None,
        }
    }

    /// Create a Scrum stage.
    pub fn scrum(name: impl Into<String>, output_schema: impl Into<String>) -> Self {
        Self {
            mode: ProcessMode::Scrum,
            ..Self::kanban(name, output_schema)
        }
    }

    /// Set the WIP limit.
    pub fn with_wip_limit(mut self, limit: usize) -> Self {
        self.wip_limit = Some(limit);
        self
    }

    /// Effective WIP limit; `None` means unbounded.
    pub fn effective_wip_limit(&self) -> Option<usize> {
        match self.mode {
            ProcessMode::Kanban => Some(self.wip_limit.unwrap_or(1)),
            ProcessMode::Scrum => self.wip_limit,
        }
    }

    /// Command timeout, defaulting to five minutes.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(300))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Schemas
// ─────────────────────────────────────────────────────────────────────────────

/// Structural schema for one artifact type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub artifact_type: String,

    #[serde(default = "default_schema_version")]
    pub version: u32,

    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

fn default_schema_version() -> u32 {
    1
}

impl SchemaConfig {
    pub fn new(artifact_type: impl Into<String>) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            version: 1,
            fields: Vec::new(),
        }
    }

    /// Add a required field.
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldConfig {
            name: name.into(),
            field_type,
            required: true,
        });
        self
    }

    /// Add an optional field.
    pub fn optional(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldConfig {
            name: name.into(),
            field_type,
            required: false,
        });
        self
    }
}

/// One field of a schema, addressed by dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Consistency rules
// ─────────────────────────────────────────────────────────────────────────────

/// How a failed consistency rule affects the downstream stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Recorded as a warning; the downstream stage proceeds.
    Partial,
    /// Halts the downstream stage pending a decision.
    Blocking,
}

/// A cross-artifact rule comparing a stage's output with an upstream artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    /// Stage whose output is checked.
    pub stage: String,
    /// Stage whose artifact is compared against.
    pub upstream: String,
    pub severity: Severity,
    pub check: RuleCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The comparison a rule performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCheck {
    /// Every string in the upstream array appears, verbatim or as a
    /// substring, in at least one downstream field.
    KeywordCoverage {
        upstream_field: String,
        downstream_fields: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    /// Upstream and downstream values are equal.
    FieldEquals {
        upstream_field: String,
        downstream_field: String,
    },
    /// The downstream array is at least as long as the upstream array.
    CountAtLeast {
        upstream_field: String,
        downstream_field: String,
    },
    /// Every downstream array element appears in the upstream array.
    SubsetOf {
        upstream_field: String,
        downstream_field: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
[retry]
delays_ms = [10, 20]
max_retries = 3

[validation]
escalate_partial_after = 4

[[stages]]
name = "spike"
output_schema = "spike_report"
wip_limit = 2

[[stages]]
name = "spy"
output_schema = "spy_report"

[[stages]]
name = "implement"
mode = "scrum"
output_schema = "change"

[schemas.spike_report]
artifact_type = "spike_report"
fields = [
    { name = "keywords", type = "array" },
    { name = "summary", type = "string", required = false },
]

[schemas.spy_report]
artifact_type = "spy_report"
version = 2
fields = [{ name = "search.query", type = "string" }]

[schemas.change]
artifact_type = "change"

[[rules]]
id = "keywords-carried"
stage = "spy"
upstream = "spike"
severity = "blocking"
check = { kind = "keyword_coverage", upstream_field = "keywords", downstream_fields = ["search.query"] }
"#;

    #[test]
    fn test_parse_pipeline() {
        let config = HandoffConfig::from_toml(PIPELINE).unwrap();
        assert_eq!(config.stage_names(), vec!["spike", "spy", "implement"]);
        assert_eq!(config.stage("spike").unwrap().effective_wip_limit(), Some(2));
        assert_eq!(config.stage("spy").unwrap().effective_wip_limit(), Some(1));
        assert_eq!(config.stage("implement").unwrap().effective_wip_limit(), None);
        assert_eq!(config.schema("spy_report").unwrap().version, 2);
        assert!(!config.schema("spike_report").unwrap().fields[1].required);
        assert_eq!(config.rules_for("spy").len(), 1);
        assert!(matches!(
            config.rules[0].check,
            RuleCheck::KeywordCoverage { case_insensitive: false, .. }
        ));
        assert_eq!(config.validation().escalate_partial_after, Some(4));
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = HandoffConfig::new();
        let retry = config.retry();
        assert_eq!(retry.delays_ms, vec![1_000, 5_000, 15_000]);
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.format_reattempts, 1);
        assert_eq!(config.sprint().capacity_points, 20);
        assert_eq!(config.gate().items_field, "work_items");
        assert!(config.validation().escalate_partial_after.is_none());
    }

    #[test]
    fn test_retry_delay_for_repeats_last() {
        let retry = RetrySection {
            delays_ms: vec![10, 20],
            max_retries: 4,
            format_reattempts: 1,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for(2), Duration::from_millis(20));
        assert_eq!(retry.delay_for(4), Duration::from_millis(20));
    }

    #[test]
    fn test_validate_rejects_kanban_after_scrum() {
        let mut config = HandoffConfig::from_toml(PIPELINE).unwrap();
        config.stages.push(StageConfig::kanban("late", "change"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("kanban stages must come first"));
    }

    #[test]
    fn test_validate_rejects_unknown_schema() {
        let mut config = HandoffConfig::from_toml(PIPELINE).unwrap();
        config.stages[0].output_schema = "missing".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSchema { .. }));
    }

    #[test]
    fn test_validate_rejects_backwards_rule() {
        let mut config = HandoffConfig::from_toml(PIPELINE).unwrap();
        config.rules[0].upstream = "spy".into();
        config.rules[0].stage = "spike".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must come before"));
    }

    #[test]
    fn test_validate_rejects_zero_wip() {
        let mut config = HandoffConfig::from_toml(PIPELINE).unwrap();
        config.stages[0].wip_limit = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_stage() {
        let mut config = HandoffConfig::from_toml(PIPELINE).unwrap();
        config.stages.insert(1, StageConfig::kanban("spike", "spike_report"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate stage"));
    }

    #[test]
    fn test_validate_requires_stages() {
        let err = HandoffConfig::new().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_merge_stages_by_name() {
        let mut base = HandoffConfig::from_toml(PIPELINE).unwrap();
        let overlay = HandoffConfig::from_toml(
            r#"
[[stages]]
name = "spy"
output_schema = "spy_report"
wip_limit = 5

[[stages]]
name = "review"
mode = "scrum"
output_schema = "change"
"#,
        )
        .unwrap();
        base.merge(overlay);
        assert_eq!(base.stage_names(), vec!["spike", "spy", "implement", "review"]);
        assert_eq!(base.stage("spy").unwrap().wip_limit, Some(5));
        // sections absent from the overlay are kept
        assert_eq!(base.retry().delays_ms, vec![10, 20]);
    }

    #[test]
    fn test_toml_roundtrip_preserves_rules() {
        let config = HandoffConfig::from_toml(PIPELINE).unwrap();
        let text = config.to_toml().unwrap();
        let back = HandoffConfig::from_toml(&text).unwrap();
        assert_eq!(back.rules, config.rules);
        assert_eq!(back.stages, config.stages);
    }

    #[test]
    fn test_effective_state_dir_configured() {
        let section = EngineSection {
            state_dir: Some(PathBuf::from("/tmp/handoff-state")),
            ..Default::default()
        };
        if std::env::var(STATE_DIR_ENV).is_err() {
            assert_eq!(
                section.effective_state_dir(),
                PathBuf::from("/tmp/handoff-state")
            );
        }
    }
}
