use thiserror::Error;

use crate::report::ValidationResult;

#[derive(Debug, Error)]
pub enum CadenceError {
    // Context errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Handoff chain mismatch: context has {expected:?}, outputs have {found:?}")]
    ChainMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    // Path errors
    #[error("Path resolution failed: {0}")]
    PathResolution(String),

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Handoff {transition} is already being written for campaign {campaign_id}")]
    HandoffInProgress {
        campaign_id: String,
        transition: String,
    },

    #[error("Operation timed out after {timeout_secs}s: {operation}")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("Campaign cancelled: {0}")]
    Cancelled(String),

    // Validation errors (one per validator layer, each carrying the full result)
    #[error("Schema validation failed for {transition}: {}", .result.schema_errors.join("; "))]
    SchemaValidation {
        transition: String,
        result: Box<ValidationResult>,
    },

    #[error("Dependency validation failed for {transition}: missing {}", .result.missing_dependencies.join(", "))]
    DependencyValidation {
        transition: String,
        result: Box<ValidationResult>,
    },

    #[error("Consistency validation failed for {transition}: {}", .result.consistency_issues.join("; "))]
    ConsistencyValidation {
        transition: String,
        result: Box<ValidationResult>,
    },

    #[error("Path validation failed for {transition}: {}", .result.errors.join("; "))]
    PathValidation {
        transition: String,
        result: Box<ValidationResult>,
    },

    // Config file errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Monitoring errors (never propagated into a handoff)
    #[error("Metrics store error: {0}")]
    Metrics(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CadenceError {
    /// The validation result carried by a validator-layer error, if any.
    pub fn validation_result(&self) -> Option<&ValidationResult> {
        match self {
            Self::SchemaValidation { result, .. }
            | Self::DependencyValidation { result, .. }
            | Self::ConsistencyValidation { result, .. }
            | Self::PathValidation { result, .. } => Some(result.as_ref()),
            _ => None,
        }
    }

    /// Whether this error means a stage transition was rejected by the validator.
    pub fn is_validation_failure(&self) -> bool {
        self.validation_result().is_some()
    }

    /// Whether this error came from durable storage (including I/O timeouts).
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Timeout { .. } | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_result() {
        let mut result = ValidationResult::default();
        result.add_missing_dependency("pricing-analysis.json");
        let err = CadenceError::DependencyValidation {
            transition: "content-to-design".into(),
            result: Box::new(result),
        };

        assert!(err.is_validation_failure());
        assert!(!err.is_persistence_failure());
        assert!(err.to_string().contains("pricing-analysis.json"));
        assert_eq!(
            err.validation_result().unwrap().missing_dependencies,
            vec!["pricing-analysis.json".to_string()]
        );
    }

    #[test]
    fn test_timeout_counts_as_persistence() {
        let err = CadenceError::Timeout {
            operation: "write envelope".into(),
            timeout_secs: 10,
        };
        assert!(err.is_persistence_failure());
        assert!(err.to_string().contains("10s"));
    }
}
