use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cadence_core::config::{AppConfig, PipelineConfig, ValidationConfig};
use cadence_core::envelope::HandoffEnvelope;
use cadence_core::event::{EventBus, PipelineEvent};
use cadence_core::report::{ValidationLayer, ValidationResult};
use cadence_core::types::{completion_percentage, CampaignId, Phase, Stage};

use crate::path::{missing_layout, normalize, CampaignPathResolver};

/// Four-layer gate run against every candidate envelope.
///
/// Layers share no data and run concurrently; the merged result is valid
/// only if every layer passed.
pub struct HandoffValidator {
    resolver: CampaignPathResolver,
    config: ValidationConfig,
    io_timeout: Duration,
    format_version: String,
    event_bus: Option<Arc<EventBus>>,
}

impl HandoffValidator {
    pub fn new(
        resolver: CampaignPathResolver,
        validation: &ValidationConfig,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            resolver,
            config: validation.clone(),
            io_timeout: pipeline.io_timeout(),
            format_version: pipeline.format_version.clone(),
            event_bus: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            CampaignPathResolver::new(config.campaigns_root()),
            &config.validation,
            &config.pipeline,
        )
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run all four layers against `envelope` for the campaign stored at
    /// `campaign_path` and merge their findings.
    pub async fn validate(&self, envelope: &HandoffEnvelope, campaign_path: &str) -> ValidationResult {
        let started = Instant::now();
        let transition = envelope.transition_name();
        let campaign_id = envelope.handoff_info.campaign_id.clone();
        let dir = normalize(campaign_path).map(|p| self.resolver.absolute(&p));

        let (schema, dependency, consistency, path) = tokio::join!(
            timed(async { self.check_schema(envelope) }),
            timed(async {
                match &dir {
                    Some(dir) => self.check_dependencies(envelope, dir).await,
                    None => ValidationResult::new(),
                }
            }),
            timed(async { self.check_consistency(envelope) }),
            timed(async {
                match &dir {
                    Some(dir) => self.check_path(envelope, campaign_path, dir).await,
                    None => {
                        let mut r = ValidationResult::new();
                        r.add_error(format!("campaign path '{}' is not usable", campaign_path));
                        r
                    }
                }
            }),
        );

        let layers = [
            (ValidationLayer::Schema, schema),
            (ValidationLayer::Dependency, dependency),
            (ValidationLayer::Consistency, consistency),
            (ValidationLayer::Path, path),
        ];
        let mut merged = ValidationResult::new();
        for (layer, (result, elapsed_ms)) in layers {
            debug!(
                campaign_id = %campaign_id,
                transition = %transition,
                layer = %layer,
                passed = result.is_valid,
                elapsed_ms,
                "Validation layer finished"
            );
            self.publish(PipelineEvent::ValidationLayerCompleted {
                campaign_id: campaign_id.clone(),
                transition: transition.clone(),
                layer,
                passed: result.is_valid,
                elapsed_ms,
            });
            merged.merge(result);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if merged.is_valid {
            info!(campaign_id = %campaign_id, transition = %transition, elapsed_ms, "Handoff validated");
        } else {
            warn!(
                campaign_id = %campaign_id,
                transition = %transition,
                findings = merged.blocking_count(),
                elapsed_ms,
                "Handoff rejected"
            );
        }
        self.publish(PipelineEvent::ValidationCompleted {
            campaign_id,
            transition,
            result: merged.clone(),
            elapsed_ms,
        });
        merged
    }

    /// Validate a raw envelope file. Unparseable files fail the schema layer.
    pub async fn validate_file(&self, file: &Path, campaign_path: &str) -> ValidationResult {
        let read = tokio::time::timeout(self.io_timeout, tokio::fs::read(file)).await;
        let bytes = match read {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                let mut r = ValidationResult::new();
                r.add_error(format!("cannot read {}: {}", file.display(), e));
                return r;
            }
            Err(_) => {
                let mut r = ValidationResult::new();
                r.add_error(format!(
                    "reading {} timed out after {}s",
                    file.display(),
                    self.io_timeout.as_secs()
                ));
                return r;
            }
        };

        match serde_json::from_slice::<HandoffEnvelope>(&bytes) {
            Ok(envelope) => self.validate(&envelope, campaign_path).await,
            Err(e) => {
                let mut r = ValidationResult::new();
                r.add_schema_error(format!("{} is not a handoff envelope: {}", file.display(), e));
                r
            }
        }
    }

    // ── Layer 1: schema ─────────────────────────────────────────

    /// Structural conformance for the declared `(from, to)` pair.
    pub fn check_schema(&self, envelope: &HandoffEnvelope) -> ValidationResult {
        let mut result = ValidationResult::new();
        let info = &envelope.handoff_info;
        let from = info.source_stage;
        let status = &envelope.workflow_status;

        if info.target_stage != from.next() {
            result.add_schema_error(format!(
                "{} is not an adjacent transition",
                envelope.transition_name()
            ));
        }
        if info.format_version != self.format_version {
            result.add_schema_error(format!(
                "format_version '{}' is not supported (expected '{}')",
                info.format_version, self.format_version
            ));
        }
        if Uuid::parse_str(&info.handoff_id).is_err() {
            result.add_schema_error(format!("handoff_id '{}' is not a UUID", info.handoff_id));
        }
        if CampaignId::parse(info.campaign_id.as_str()).is_err() {
            result.add_schema_error(format!("campaign_id '{}' is not valid", info.campaign_id));
        }

        let stages = envelope.specialist_outputs.stages();
        let mut expected: Vec<Stage> = from.predecessors().to_vec();
        expected.push(from);
        if stages != expected {
            result.add_schema_error(format!(
                "specialist_outputs has {:?}, expected {:?}",
                names(&stages),
                names(&expected)
            ));
        }
        if status.completed_stages != stages {
            result.add_schema_error(format!(
                "workflow_status.completed_stages {:?} does not match specialist_outputs {:?}",
                names(&status.completed_stages),
                names(&stages)
            ));
        }
        if status.current_stage != from {
            result.add_schema_error(format!(
                "workflow_status.current_stage '{}' does not match source stage '{}'",
                status.current_stage, from
            ));
        }
        if status.next_stage != info.target_stage {
            result.add_schema_error("workflow_status.next_stage does not match target stage");
        }
        if !status.completion_percentage.is_finite()
            || !(0.0..=100.0).contains(&status.completion_percentage)
        {
            result.add_schema_error(format!(
                "completion_percentage {} outside 0..=100",
                status.completion_percentage
            ));
        }

        for (stage, output) in envelope.specialist_outputs.iter() {
            for field in self.config.required_fields_for(stage) {
                if output.get(&field).is_none() {
                    result.add_schema_error(format!(
                        "{}: missing required field '{}'",
                        stage, field
                    ));
                }
            }
            for file in &output.files {
                if !is_relative_inside(file) {
                    result.add_schema_error(format!(
                        "{}: file reference '{}' must be relative to the campaign root",
                        stage, file
                    ));
                }
            }
            for preserved in &output.preserve {
                if output.lookup(preserved).is_none() {
                    result.add_warning(format!(
                        "{}: preserved path '{}' does not exist",
                        stage, preserved
                    ));
                }
            }
        }

        result
    }

    // ── Layer 2: dependencies ───────────────────────────────────

    /// Every declared file must exist under the campaign root and be non-empty.
    /// References that leave the campaign root are never touched; the schema
    /// layer reports them.
    pub async fn check_dependencies(&self, envelope: &HandoffEnvelope, dir: &Path) -> ValidationResult {
        let declared: Vec<(Stage, &String)> = envelope
            .specialist_outputs
            .iter()
            .flat_map(|(stage, output)| output.files.iter().map(move |f| (stage, f)))
            .filter(|(_, file)| is_relative_inside(file))
            .collect();

        let checks = declared.iter().map(|(stage, file)| async move {
            let state = inspect_file(&dir.join(file.as_str()), self.io_timeout).await;
            (*stage, *file, state)
        });
        let outcomes = futures::future::join_all(checks).await;

        let mut result = ValidationResult::new();
        for (stage, file, state) in outcomes {
            match state {
                FileState::Present => {}
                FileState::Missing => result.add_missing_dependency(file.as_str()),
                FileState::Empty => {
                    result.add_missing_dependency(file.as_str());
                    result.add_warning(format!("{}: dependency '{}' is empty", stage, file));
                }
                FileState::NotAFile => {
                    result.add_missing_dependency(file.as_str());
                    result.add_warning(format!("{}: dependency '{}' is not a file", stage, file));
                }
                FileState::TimedOut => {
                    result.add_missing_dependency(file.as_str());
                    result.add_warning(format!(
                        "{}: checking '{}' timed out after {}s",
                        stage,
                        file,
                        self.io_timeout.as_secs()
                    ));
                }
            }
        }
        result
    }

    // ── Layer 3: consistency ────────────────────────────────────

    /// Cross-field checks between deliverables and envelope metadata.
    pub fn check_consistency(&self, envelope: &HandoffEnvelope) -> ValidationResult {
        let mut result = ValidationResult::new();
        let info = &envelope.handoff_info;
        let snapshot = &envelope.campaign_context;
        let status = &envelope.workflow_status;

        if snapshot.id != info.campaign_id {
            result.add_consistency_issue(format!(
                "campaign_context.id '{}' differs from handoff_info.campaign_id '{}'",
                snapshot.id, info.campaign_id
            ));
        }

        let expected_pct = completion_percentage(status.completed_stages.len(), Stage::ALL.len());
        if (status.completion_percentage - expected_pct).abs() > 1e-9 {
            result.add_consistency_issue(format!(
                "completion_percentage {} does not match {} completed stages ({})",
                status.completion_percentage,
                status.completed_stages.len(),
                expected_pct
            ));
        }

        let expected_phase = info
            .target_stage
            .map(Phase::from)
            .unwrap_or(Phase::Orchestration);
        if status.phase != expected_phase.as_str() {
            result.add_warning(format!(
                "workflow_status.phase '{}' differs from '{}'",
                status.phase, expected_phase
            ));
        }

        for (stage, output) in envelope.specialist_outputs.iter() {
            for rule in self.config.count_rules_for(stage) {
                let Some(declared) = output.get(&rule.count_key) else {
                    continue;
                };
                let Some(count) = declared.as_u64() else {
                    result.add_consistency_issue(format!(
                        "{}: '{}' must be a non-negative integer",
                        stage, rule.count_key
                    ));
                    continue;
                };
                match output.get(&rule.list_key).and_then(Value::as_array) {
                    Some(list) if list.len() as u64 == count => {}
                    Some(list) => result.add_consistency_issue(format!(
                        "{}: '{}' declares {} but '{}' has {}",
                        stage,
                        rule.count_key,
                        count,
                        rule.list_key,
                        list.len()
                    )),
                    None => result.add_consistency_issue(format!(
                        "{}: '{}' declares {} but '{}' is not a list",
                        stage, rule.count_key, count, rule.list_key
                    )),
                }
            }
        }

        if let Some(quality) = envelope.specialist_outputs.get(Stage::Quality) {
            if quality.get("approved").and_then(Value::as_bool) == Some(false) {
                result.add_consistency_issue(
                    "quality: output is marked approved=false and cannot proceed",
                );
            }
        }

        if let Some(language) = envelope
            .specialist_outputs
            .get(Stage::Content)
            .and_then(|c| c.get("language"))
            .and_then(Value::as_str)
        {
            if !language.eq_ignore_ascii_case(&snapshot.language) {
                result.add_consistency_issue(format!(
                    "content: language '{}' differs from campaign language '{}'",
                    language, snapshot.language
                ));
            }
        }

        result
    }

    // ── Layer 4: path ───────────────────────────────────────────

    /// The campaign directory must exist, carry the layout, and be writable.
    pub async fn check_path(
        &self,
        envelope: &HandoffEnvelope,
        campaign_path: &str,
        dir: &Path,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        if normalize(&envelope.handoff_info.campaign_path) != normalize(campaign_path) {
            result.add_error(format!(
                "envelope campaign path '{}' differs from '{}'",
                envelope.handoff_info.campaign_path, campaign_path
            ));
        }

        let is_dir = tokio::fs::metadata(dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            result.add_error(format!("campaign directory {} does not exist", dir.display()));
            return result;
        }

        let missing = missing_layout(dir).await;
        if !missing.is_empty() {
            result.add_error(format!(
                "campaign directory is missing: {}",
                missing.join(", ")
            ));
        }

        if self.config.check_writable {
            if let Err(reason) = check_writable(dir, self.io_timeout).await {
                result.add_error(format!("campaign directory {} is not writable: {}", dir.display(), reason));
            }
        }

        result
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

async fn timed<F: Future<Output = ValidationResult>>(fut: F) -> (ValidationResult, u64) {
    let started = Instant::now();
    let result = fut.await;
    (result, started.elapsed().as_millis() as u64)
}

enum FileState {
    Present,
    Missing,
    Empty,
    NotAFile,
    TimedOut,
}

async fn inspect_file(path: &Path, limit: Duration) -> FileState {
    match tokio::time::timeout(limit, tokio::fs::metadata(path)).await {
        Err(_) => FileState::TimedOut,
        Ok(Err(_)) => FileState::Missing,
        Ok(Ok(meta)) if !meta.is_file() => FileState::NotAFile,
        Ok(Ok(meta)) if meta.len() == 0 => FileState::Empty,
        Ok(Ok(_)) => FileState::Present,
    }
}

async fn check_writable(dir: &Path, limit: Duration) -> std::result::Result<(), String> {
    let marker: PathBuf = dir.join(format!(".write-check-{}", Uuid::new_v4()));
    let outcome = tokio::time::timeout(limit, async {
        tokio::fs::write(&marker, b"ok").await?;
        tokio::fs::remove_file(&marker).await
    })
    .await;
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
    }
}

fn is_relative_inside(file: &str) -> bool {
    let path = Path::new(file);
    !file.trim().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn names(stages: &[Stage]) -> Vec<&'static str> {
    stages.iter().map(|s| s.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::envelope::{
        CampaignSnapshot, HandoffInfo, SpecialistOutputs, StageOutput, WorkflowStatus,
    };
    use cadence_core::types::{CampaignType, WorkflowType};
    use chrono::Utc;
    use serde_json::json;

    use crate::path::prepare_layout;

    const CAMPAIGN: &str = "campaigns/campaign_1000_abc/";

    fn envelope(from: Stage, outputs: SpecialistOutputs) -> HandoffEnvelope {
        let stages = outputs.stages();
        HandoffEnvelope {
            handoff_info: HandoffInfo {
                source_stage: from,
                target_stage: from.next(),
                handoff_id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                campaign_id: CampaignId("campaign_1000_abc".into()),
                campaign_path: CAMPAIGN.into(),
                trace_id: None,
                format_version: "1.0".into(),
                execution_duration_ms: None,
            },
            campaign_context: CampaignSnapshot {
                id: CampaignId("campaign_1000_abc".into()),
                name: "Spring".into(),
                brand: "Acme".into(),
                language: "en".into(),
                campaign_type: CampaignType::Promotional,
                storage_path: CAMPAIGN.into(),
                request_id: "r".into(),
                correlation_id: "c".into(),
                workflow_type: WorkflowType::FullPipeline,
            },
            workflow_status: WorkflowStatus {
                completion_percentage: completion_percentage(stages.len(), 5),
                completed_stages: stages,
                current_stage: from,
                next_stage: from.next(),
                phase: from
                    .next()
                    .map(Phase::from)
                    .unwrap_or(Phase::Orchestration)
                    .to_string(),
            },
            specialist_outputs: outputs,
        }
    }

    fn data_output() -> StageOutput {
        StageOutput::new()
            .with("market", json!({"region": "EU"}))
            .with("destination_count", json!(2))
            .with("destinations", json!(["Lisbon", "Porto"]))
    }

    fn content_output() -> StageOutput {
        StageOutput::new()
            .with("subject_lines", json!(["Hi", "Hello"]))
            .with("subject_line_count", json!(2))
            .with("body", json!("Sun awaits"))
    }

    async fn campaign_dir() -> (tempfile::TempDir, HandoffValidator) {
        let dir = tempfile::tempdir().unwrap();
        prepare_layout(&dir.path().join(CAMPAIGN), Duration::from_secs(5))
            .await
            .unwrap();
        let validator = HandoffValidator::new(
            CampaignPathResolver::new(dir.path()),
            &ValidationConfig::default(),
            &PipelineConfig::default(),
        );
        (dir, validator)
    }

    #[tokio::test]
    async fn test_valid_first_envelope() {
        let (_dir, validator) = campaign_dir().await;
        let mut outputs = SpecialistOutputs::new();
        outputs.insert(Stage::DataCollection, data_output()).unwrap();

        let result = validator
            .validate(&envelope(Stage::DataCollection, outputs), CAMPAIGN)
            .await;
        assert!(result.is_valid, "{:?}", result);
        assert_eq!(result.blocking_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_dependency_file() {
        let (dir, validator) = campaign_dir().await;
        std::fs::write(dir.path().join(CAMPAIGN).join("data/market.json"), b"{}").unwrap();

        let mut outputs = SpecialistOutputs::new();
        outputs
            .insert(Stage::DataCollection, data_output().with_file("data/market.json"))
            .unwrap();
        outputs
            .insert(Stage::Content, content_output().with_file("pricing-analysis.json"))
            .unwrap();

        let result = validator
            .validate(&envelope(Stage::Content, outputs), CAMPAIGN)
            .await;
        assert!(!result.is_valid);
        assert_eq!(result.missing_dependencies, vec!["pricing-analysis.json"]);
        assert!(result.schema_errors.is_empty());
    }

    #[tokio::test]
    async fn test_empty_dependency_counts_as_missing() {
        let (dir, validator) = campaign_dir().await;
        std::fs::write(dir.path().join(CAMPAIGN).join("data/empty.csv"), b"").unwrap();
        let mut outputs = SpecialistOutputs::new();
        outputs
            .insert(Stage::DataCollection, data_output().with_file("data/empty.csv"))
            .unwrap();

        let result = validator
            .validate(&envelope(Stage::DataCollection, outputs), CAMPAIGN)
            .await;
        assert_eq!(result.missing_dependencies, vec!["data/empty.csv"]);
        assert!(result.warnings.iter().any(|w| w.contains("empty")));
    }

    #[tokio::test]
    async fn test_references_outside_campaign_are_never_read() {
        let (dir, validator) = campaign_dir().await;
        let outside = dir.path().join("campaigns/outside.json");
        std::fs::write(&outside, b"{}").unwrap();

        let mut outputs = SpecialistOutputs::new();
        outputs
            .insert(
                Stage::DataCollection,
                data_output()
                    .with_file("../outside.json")
                    .with_file(outside.to_string_lossy().to_string()),
            )
            .unwrap();
        let env = envelope(Stage::DataCollection, outputs);

        let deps = validator
            .check_dependencies(&env, &dir.path().join(CAMPAIGN))
            .await;
        assert!(deps.is_valid);
        assert!(deps.missing_dependencies.is_empty());

        let result = validator.validate(&env, CAMPAIGN).await;
        assert!(!result.is_valid);
        assert_eq!(result.schema_errors.len(), 2);
        assert!(result.missing_dependencies.is_empty());
    }

    #[test]
    fn test_schema_catches_accumulation_gap() {
        let validator = HandoffValidator::new(
            CampaignPathResolver::new("."),
            &ValidationConfig::default(),
            &PipelineConfig::default(),
        );
        let mut outputs = SpecialistOutputs::new();
        outputs.insert(Stage::Content, content_output()).unwrap();
        let result = validator.check_schema(&envelope(Stage::Content, outputs));
        assert!(!result.is_valid);
        assert!(result
            .schema_errors
            .iter()
            .any(|e| e.contains("specialist_outputs")));
    }

    #[test]
    fn test_schema_required_fields_and_version() {
        let validator = HandoffValidator::new(
            CampaignPathResolver::new("."),
            &ValidationConfig::default(),
            &PipelineConfig::default(),
        );
        let mut outputs = SpecialistOutputs::new();
        outputs
            .insert(Stage::DataCollection, StageOutput::new().with("notes", json!("x")))
            .unwrap();
        let mut env = envelope(Stage::DataCollection, outputs);
        env.handoff_info.format_version = "0.9".into();

        let result = validator.check_schema(&env);
        assert!(result.schema_errors.iter().any(|e| e.contains("'market'")));
        assert!(result.schema_errors.iter().any(|e| e.contains("format_version")));
    }

    #[test]
    fn test_consistency_count_mismatch() {
        let validator = HandoffValidator::new(
            CampaignPathResolver::new("."),
            &ValidationConfig::default(),
            &PipelineConfig::default(),
        );
        let mut outputs = SpecialistOutputs::new();
        outputs.insert(Stage::DataCollection, data_output()).unwrap();
        outputs.insert(Stage::Content, content_output()).unwrap();
        outputs
            .insert(
                Stage::Design,
                StageOutput::new()
                    .with("template", json!("<mjml/>"))
                    .with("required_asset_count", json!(3))
                    .with("assets", json!(["hero.png", "logo.png"])),
            )
            .unwrap();

        let result = validator.check_consistency(&envelope(Stage::Design, outputs));
        assert!(!result.is_valid);
        assert_eq!(result.consistency_issues.len(), 1);
        assert!(result.consistency_issues[0].contains("required_asset_count"));
    }

    #[test]
    fn test_consistency_quality_and_language() {
        let validator = HandoffValidator::new(
            CampaignPathResolver::new("."),
            &ValidationConfig::default(),
            &PipelineConfig::default(),
        );
        let mut outputs = SpecialistOutputs::new();
        outputs.insert(Stage::DataCollection, data_output()).unwrap();
        outputs
            .insert(Stage::Content, content_output().with("language", json!("de")))
            .unwrap();
        outputs
            .insert(Stage::Design, StageOutput::new().with("template", json!("t")))
            .unwrap();
        outputs
            .insert(
                Stage::Quality,
                StageOutput::new()
                    .with("score", json!(41))
                    .with("approved", json!(false)),
            )
            .unwrap();

        let mut env = envelope(Stage::Quality, outputs);
        env.workflow_status.completion_percentage = 50.0;
        let result = validator.check_consistency(&env);
        assert!(result.consistency_issues.iter().any(|i| i.contains("approved")));
        assert!(result.consistency_issues.iter().any(|i| i.contains("language")));
        assert!(result.consistency_issues.iter().any(|i| i.contains("completion_percentage")));
    }

    #[tokio::test]
    async fn test_path_layer_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let validator = HandoffValidator::new(
            CampaignPathResolver::new(dir.path()),
            &ValidationConfig::default(),
            &PipelineConfig::default(),
        );
        let mut outputs = SpecialistOutputs::new();
        outputs.insert(Stage::DataCollection, data_output()).unwrap();

        let result = validator
            .validate(&envelope(Stage::DataCollection, outputs), CAMPAIGN)
            .await;
        assert!(!result.is_valid);
        assert_eq!(result.failing_layers(), vec![ValidationLayer::Path]);
    }

    #[tokio::test]
    async fn test_validate_file_rejects_garbage() {
        let (dir, validator) = campaign_dir().await;
        let file = dir.path().join(CAMPAIGN).join("handoffs/data-to-content.json");
        std::fs::write(&file, b"{\"handoff_info\": 3}").unwrap();

        let result = validator.validate_file(&file, CAMPAIGN).await;
        assert!(!result.is_valid);
        assert_eq!(result.failing_layers(), vec![ValidationLayer::Schema]);
    }

    #[tokio::test]
    async fn test_layer_events_published() {
        let (_dir, validator) = campaign_dir().await;
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let validator = validator.with_event_bus(bus);

        let mut outputs = SpecialistOutputs::new();
        outputs.insert(Stage::DataCollection, data_output()).unwrap();
        validator
            .validate(&envelope(Stage::DataCollection, outputs), CAMPAIGN)
            .await;

        let mut layers = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                PipelineEvent::ValidationLayerCompleted { layer, passed, .. } => {
                    assert!(passed);
                    layers.push(layer);
                }
                PipelineEvent::ValidationCompleted { result, .. } => {
                    assert!(result.is_valid);
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(layers, ValidationLayer::ALL.to_vec());
    }
}
