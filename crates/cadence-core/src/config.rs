use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::types::Stage;

/// Top-level cadence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub continuity: ContinuityConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base directory that relative campaign paths resolve against.
    #[serde(default = "default_campaigns_root")]
    pub campaigns_root: String,
    /// Per-operation timeout for envelope and dependency I/O.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// Envelope format version written into `handoff_info`.
    #[serde(default = "default_format_version")]
    pub format_version: String,
    /// Create the campaign directory layout when a campaign starts.
    #[serde(default = "default_create_layout")]
    pub create_layout: bool,
    /// A handoff lock older than this, or held by a process that is gone,
    /// is archived and retaken.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            campaigns_root: default_campaigns_root(),
            io_timeout_secs: default_io_timeout(),
            format_version: default_format_version(),
            create_layout: default_create_layout(),
            lock_stale_secs: default_lock_stale_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

fn default_campaigns_root() -> String { ".".to_string() }
fn default_io_timeout() -> u64 { 10 }
fn default_format_version() -> String { crate::envelope::FORMAT_VERSION.to_string() }
fn default_create_layout() -> bool { true }
fn default_lock_stale_secs() -> u64 { 300 }

/// A declared count that must match the length of a list deliverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRule {
    pub count_key: String,
    pub list_key: String,
}

impl CountRule {
    pub fn new(count_key: impl Into<String>, list_key: impl Into<String>) -> Self {
        Self {
            count_key: count_key.into(),
            list_key: list_key.into(),
        }
    }
}

/// Per-stage schema expectations. Stages missing from a map fall back to
/// the built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Deliverable keys each stage must produce, keyed by stage name.
    #[serde(default)]
    pub required_fields: BTreeMap<String, Vec<String>>,
    /// Count/list consistency pairs, keyed by stage name.
    #[serde(default)]
    pub count_rules: BTreeMap<String, Vec<CountRule>>,
    /// Probe the campaign directory for writability.
    #[serde(default = "default_check_writable")]
    pub check_writable: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_fields: BTreeMap::new(),
            count_rules: BTreeMap::new(),
            check_writable: default_check_writable(),
        }
    }
}

fn default_check_writable() -> bool { true }

impl ValidationConfig {
    pub fn required_fields_for(&self, stage: Stage) -> Vec<String> {
        self.required_fields
            .get(stage.as_str())
            .cloned()
            .unwrap_or_else(|| default_required_fields(stage))
    }

    pub fn count_rules_for(&self, stage: Stage) -> Vec<CountRule> {
        self.count_rules
            .get(stage.as_str())
            .cloned()
            .unwrap_or_else(|| default_count_rules(stage))
    }
}

fn default_required_fields(stage: Stage) -> Vec<String> {
    let fields: &[&str] = match stage {
        Stage::DataCollection => &["market"],
        Stage::Content => &["subject_lines", "body"],
        Stage::Design => &["template"],
        Stage::Quality => &["score"],
        Stage::Delivery => &["exports"],
    };
    fields.iter().map(|f| f.to_string()).collect()
}

fn default_count_rules(stage: Stage) -> Vec<CountRule> {
    match stage {
        Stage::DataCollection => vec![CountRule::new("destination_count", "destinations")],
        Stage::Content => vec![CountRule::new("subject_line_count", "subject_lines")],
        Stage::Design => vec![CountRule::new("required_asset_count", "assets")],
        Stage::Quality => vec![],
        Stage::Delivery => vec![CountRule::new("export_count", "exports")],
    }
}

/// Continuity scoring knobs. Weights are normalised before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityConfig {
    #[serde(default = "default_field_presence_weight")]
    pub field_presence_weight: f64,
    #[serde(default = "default_non_empty_weight")]
    pub non_empty_weight: f64,
    #[serde(default = "default_preserved_weight")]
    pub preserved_weight: f64,
    /// Transitions below this score are reported.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Points below threshold at which an issue becomes critical.
    #[serde(default = "default_critical_gap")]
    pub critical_gap: f64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            field_presence_weight: default_field_presence_weight(),
            non_empty_weight: default_non_empty_weight(),
            preserved_weight: default_preserved_weight(),
            threshold: default_threshold(),
            critical_gap: default_critical_gap(),
        }
    }
}

impl ContinuityConfig {
    /// Weights scaled to sum to 1, as (field presence, non-empty, preserved).
    pub fn normalized_weights(&self) -> Result<(f64, f64, f64)> {
        let weights = [
            self.field_presence_weight,
            self.non_empty_weight,
            self.preserved_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(CadenceError::Config(
                "continuity weights must be finite and non-negative".into(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return Err(CadenceError::Config(
                "continuity weights must not all be zero".into(),
            ));
        }
        Ok((weights[0] / sum, weights[1] / sum, weights[2] / sum))
    }
}

fn default_field_presence_weight() -> f64 { 0.4 }
fn default_non_empty_weight() -> f64 { 0.3 }
fn default_preserved_weight() -> f64 { 0.3 }
fn default_threshold() -> f64 { 70.0 }
fn default_critical_gap() -> f64 { 20.0 }

/// Handoff monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,
    /// SQLite file for persisted metrics. In-memory only when unset.
    #[serde(default)]
    pub metrics_db: Option<String>,
    /// Handoffs slower than this raise an alert.
    #[serde(default = "default_slow_handoff_ms")]
    pub slow_handoff_ms: u64,
    /// Envelopes larger than this raise an alert.
    #[serde(default = "default_large_payload_bytes")]
    pub large_payload_bytes: u64,
    /// JSONL log verbosity: 1 = campaign summary, 2 = per handoff, 3 = per layer.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    /// In-memory records kept per campaign; the oldest are dropped first.
    #[serde(default = "default_max_records")]
    pub max_records_per_campaign: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            metrics_db: None,
            slow_handoff_ms: default_slow_handoff_ms(),
            large_payload_bytes: default_large_payload_bytes(),
            log_level: default_log_level(),
            max_records_per_campaign: default_max_records(),
        }
    }
}

fn default_monitor_enabled() -> bool { true }
fn default_slow_handoff_ms() -> u64 { 5_000 }
fn default_large_payload_bytes() -> u64 { 1_048_576 }
fn default_log_level() -> u8 { 2 }
fn default_max_records() -> usize { 1_000 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CadenceError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| CadenceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.io_timeout_secs == 0 {
            return Err(CadenceError::Config(
                "pipeline.io_timeout_secs must be positive".into(),
            ));
        }
        if self.pipeline.lock_stale_secs == 0 {
            return Err(CadenceError::Config(
                "pipeline.lock_stale_secs must be positive".into(),
            ));
        }
        if self.monitor.max_records_per_campaign == 0 {
            return Err(CadenceError::Config(
                "monitor.max_records_per_campaign must be positive".into(),
            ));
        }
        self.continuity.normalized_weights()?;
        if !(0.0..=100.0).contains(&self.continuity.threshold) {
            return Err(CadenceError::Config(
                "continuity.threshold must be within 0..=100".into(),
            ));
        }
        if self.continuity.critical_gap <= 0.0 {
            return Err(CadenceError::Config(
                "continuity.critical_gap must be positive".into(),
            ));
        }
        for key in self
            .validation
            .required_fields
            .keys()
            .chain(self.validation.count_rules.keys())
        {
            key.parse::<Stage>()
                .map_err(|_| CadenceError::Config(format!("unknown stage '{}' in [validation]", key)))?;
        }
        Ok(())
    }

    /// Resolve the campaigns root directory (expand ~).
    pub fn campaigns_root(&self) -> PathBuf {
        expand_home(&self.pipeline.campaigns_root)
    }

    /// Resolve the metrics database path, if configured.
    pub fn metrics_db_path(&self) -> Option<PathBuf> {
        self.monitor.metrics_db.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
