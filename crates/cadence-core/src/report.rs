use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::types::{CampaignId, Stage};

/// The four independently runnable validator layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLayer {
    Schema,
    Dependency,
    Consistency,
    Path,
}

impl ValidationLayer {
    pub const ALL: [ValidationLayer; 4] = [
        ValidationLayer::Schema,
        ValidationLayer::Dependency,
        ValidationLayer::Consistency,
        ValidationLayer::Path,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Dependency => "dependency",
            Self::Consistency => "consistency",
            Self::Path => "path",
        }
    }
}

impl std::fmt::Display for ValidationLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating a candidate envelope.
///
/// Warnings never affect `is_valid`; every other list does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub missing_dependencies: Vec<String>,
    #[serde(default)]
    pub schema_errors: Vec<String>,
    #[serde(default)]
    pub consistency_issues: Vec<String>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            missing_dependencies: vec![],
            schema_errors: vec![],
            consistency_issues: vec![],
        }
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn add_missing_dependency(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.missing_dependencies.contains(&path) {
            self.missing_dependencies.push(path);
        }
        self.is_valid = false;
    }

    pub fn add_schema_error(&mut self, message: impl Into<String>) {
        self.schema_errors.push(message.into());
        self.is_valid = false;
    }

    pub fn add_consistency_issue(&mut self, message: impl Into<String>) {
        self.consistency_issues.push(message.into());
        self.is_valid = false;
    }

    /// Fold another layer's result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        for dep in other.missing_dependencies {
            if !self.missing_dependencies.contains(&dep) {
                self.missing_dependencies.push(dep);
            }
        }
        self.schema_errors.extend(other.schema_errors);
        self.consistency_issues.extend(other.consistency_issues);
        self.is_valid = self.is_valid && other.is_valid && self.blocking_count() == 0;
    }

    /// Merge a set of layer results into one.
    pub fn merged(results: impl IntoIterator<Item = ValidationResult>) -> Self {
        let mut merged = Self::new();
        for result in results {
            merged.merge(result);
        }
        merged
    }

    /// Number of findings that block the pipeline.
    pub fn blocking_count(&self) -> usize {
        self.errors.len()
            + self.missing_dependencies.len()
            + self.schema_errors.len()
            + self.consistency_issues.len()
    }

    /// Layers that reported a blocking finding. Plain `errors` are attributed
    /// to the path layer, the only layer that reports them.
    pub fn failing_layers(&self) -> Vec<ValidationLayer> {
        let mut layers = Vec::new();
        if !self.schema_errors.is_empty() {
            layers.push(ValidationLayer::Schema);
        }
        if !self.missing_dependencies.is_empty() {
            layers.push(ValidationLayer::Dependency);
        }
        if !self.consistency_issues.is_empty() {
            layers.push(ValidationLayer::Consistency);
        }
        if !self.errors.is_empty() {
            layers.push(ValidationLayer::Path);
        }
        layers
    }

    /// Every blocking finding, prefixed with the list it came from.
    pub fn all_findings(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.blocking_count());
        out.extend(self.schema_errors.iter().map(|e| format!("schema: {}", e)));
        out.extend(
            self.missing_dependencies
                .iter()
                .map(|d| format!("missing dependency: {}", d)),
        );
        out.extend(
            self.consistency_issues
                .iter()
                .map(|c| format!("consistency: {}", c)),
        );
        out.extend(self.errors.iter().map(|e| format!("error: {}", e)));
        out
    }

    /// Turn a failed result into the error for its most fundamental failing
    /// layer (schema, then dependency, then consistency, then path).
    pub fn into_error(self, transition: &str) -> Option<CadenceError> {
        if self.is_valid && self.blocking_count() == 0 {
            return None;
        }
        let transition = transition.to_string();
        let layer = self
            .failing_layers()
            .first()
            .copied()
            .unwrap_or(ValidationLayer::Path);
        let result = Box::new(self);
        Some(match layer {
            ValidationLayer::Schema => CadenceError::SchemaValidation { transition, result },
            ValidationLayer::Dependency => {
                CadenceError::DependencyValidation { transition, result }
            }
            ValidationLayer::Consistency => {
                CadenceError::ConsistencyValidation { transition, result }
            }
            ValidationLayer::Path => CadenceError::PathValidation { transition, result },
        })
    }

    /// `Ok(self)` if valid, otherwise the layer error.
    pub fn ensure_valid(self, transition: &str) -> Result<Self> {
        if self.is_valid && self.blocking_count() == 0 {
            return Ok(self);
        }
        match self.into_error(transition) {
            Some(err) => Err(err),
            None => Err(CadenceError::Configuration(format!(
                "Validation for {} failed without findings",
                transition
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl IssueSeverity {
    /// Severity for a score `gap` points below the threshold.
    pub fn from_gap(gap: f64, critical_gap: f64) -> Self {
        if gap >= critical_gap {
            Self::Critical
        } else if gap >= critical_gap / 2.0 {
            Self::High
        } else if gap >= critical_gap / 4.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    DataLoss,
    QualityDegradation,
    SpecificationDrift,
    ContextLoss,
}

/// Score of one transition in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionScore {
    /// Transition name, e.g. `content-to-design`.
    pub transition: String,
    /// Stage whose contribution is being scored.
    pub stage: Stage,
    /// Stage whose envelope preceded this one (`None` at the chain start).
    pub previous_stage: Option<Stage>,
    /// Ratio of required deliverables present (0..=1).
    pub field_presence: f64,
    /// Ratio of non-empty leaf values in the contribution (0..=1).
    pub non_empty_ratio: f64,
    /// Ratio of preserved fields carried forward unchanged (0..=1).
    pub preservation: f64,
    /// Weighted score (0..=100).
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityIssue {
    pub severity: IssueSeverity,
    pub issue_type: IssueType,
    pub transition: String,
    pub stage: Stage,
    pub description: String,
}

/// Diagnostic analytics over an envelope chain. Never persisted as state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityReport {
    pub campaign_id: Option<CampaignId>,
    pub generated_at: DateTime<Utc>,
    pub transitions: Vec<TransitionScore>,
    pub continuity_score: f64,
    pub continuity_issues: Vec<ContinuityIssue>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl ContinuityReport {
    pub fn critical_issues(&self) -> impl Iterator<Item = &ContinuityIssue> {
        self.continuity_issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Critical)
    }

    pub fn has_critical(&self) -> bool {
        self.critical_issues().next().is_some()
    }

    /// Transitions scoring below `threshold`.
    pub fn degraded_transitions(&self, threshold: f64) -> Vec<&TransitionScore> {
        self.transitions
            .iter()
            .filter(|t| t.score < threshold)
            .collect()
    }
}
