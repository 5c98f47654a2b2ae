use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use cadence_core::envelope::{HandoffEnvelope, StageResult};
use cadence_core::error::{CadenceError, Result};
use cadence_core::report::ValidationResult;
use cadence_core::types::{
    CampaignContext, CampaignId, CampaignIdentity, CampaignType, JsonMap, Phase, Stage,
    WorkflowType,
};

/// Campaign identity as supplied by a caller. Every field is optional so
/// that absence can be detected rather than defaulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdentity {
    pub id: Option<String>,
    pub name: Option<String>,
    pub storage_path: Option<String>,
    pub brand: Option<String>,
    pub language: Option<String>,
    #[serde(rename = "type")]
    pub campaign_type: Option<CampaignType>,
}

/// A request to start a campaign run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    #[serde(default)]
    pub workflow_type: WorkflowType,
    /// Required for partial workflows; otherwise implied by the workflow type.
    pub total_phases: Option<usize>,
    #[serde(default)]
    pub campaign: RequestIdentity,
    #[serde(default)]
    pub persistent_state: JsonMap,
}

impl CampaignRequest {
    pub fn new(
        id: impl Into<String>,
        storage_path: impl Into<String>,
        brand: impl Into<String>,
    ) -> Self {
        Self {
            campaign: RequestIdentity {
                id: Some(id.into()),
                storage_path: Some(storage_path.into()),
                brand: Some(brand.into()),
                ..RequestIdentity::default()
            },
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.campaign.name = Some(name.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.campaign.language = Some(language.into());
        self
    }

    pub fn with_type(mut self, campaign_type: CampaignType) -> Self {
        self.campaign.campaign_type = Some(campaign_type);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_type: WorkflowType, total_phases: Option<usize>) -> Self {
        self.workflow_type = workflow_type;
        self.total_phases = total_phases;
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.persistent_state.insert(key.into(), value);
        self
    }
}

/// Language used when a request does not name one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Builds, extends and checks campaign contexts.
///
/// Every operation returns a new value; nothing here touches disk.
#[derive(Debug, Clone, Default)]
pub struct ContextManager;

impl ContextManager {
    pub fn new() -> Self {
        Self
    }

    /// Build a fresh context positioned on the first stage.
    pub fn create_context(&self, request: &CampaignRequest) -> Result<CampaignContext> {
        let identity = self.identity_from_request(request)?;
        let total_phases = self.total_phases(request)?;

        let context = CampaignContext {
            request_id: request
                .request_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            trace_id: request.trace_id.clone(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            workflow_type: request.workflow_type,
            current_phase: Phase::from(Stage::first()),
            total_phases,
            phase_index: 0,
            campaign: identity,
            previous_results: None,
            handoff_data: None,
            persistent_state: request.persistent_state.clone(),
            handoff_chain: vec![],
        };

        debug!(
            campaign_id = %context.campaign.id,
            request_id = %context.request_id,
            workflow = ?context.workflow_type,
            "Created campaign context"
        );
        Ok(context)
    }

    /// Rebuild a context from the latest committed envelope, positioned on
    /// the envelope's target stage. Used for explicit re-runs and partial
    /// workflows that start mid-pipeline.
    pub fn resume_context(
        &self,
        request: &CampaignRequest,
        latest: &HandoffEnvelope,
    ) -> Result<CampaignContext> {
        let mut context = self.create_context(request)?;
        if latest.handoff_info.campaign_id != context.campaign.id {
            return Err(CadenceError::Configuration(format!(
                "Envelope belongs to campaign '{}', request names '{}'",
                latest.handoff_info.campaign_id, context.campaign.id
            )));
        }

        let chain = latest.specialist_outputs.stages();
        let mut previous_results = JsonMap::new();
        for (stage, output) in latest.specialist_outputs.iter() {
            previous_results.insert(
                stage.as_str().to_string(),
                Value::Object(output.deliverables.clone()),
            );
        }

        context.phase_index = chain.len();
        context.handoff_chain = chain;
        context.current_phase = latest
            .handoff_info
            .target_stage
            .map(Phase::from)
            .unwrap_or(Phase::Orchestration);
        context.previous_results = Some(previous_results);
        if latest.handoff_info.trace_id.is_some() && context.trace_id.is_none() {
            context.trace_id = latest.handoff_info.trace_id.clone();
        }

        debug!(
            campaign_id = %context.campaign.id,
            phase = %context.current_phase,
            completed = context.handoff_chain.len(),
            "Resumed campaign context from envelope"
        );
        Ok(context)
    }

    /// Return the context that follows the current stage's completion.
    ///
    /// `phase_index` grows by one, the stage is appended to the chain, and
    /// persistent state is merged shallowly (later keys win).
    pub fn enhance_for_handoff(
        &self,
        context: &CampaignContext,
        result: &StageResult,
    ) -> Result<CampaignContext> {
        let stage = context.current_stage().ok_or_else(|| {
            CadenceError::Configuration(format!(
                "Context for campaign '{}' is not positioned on a stage (phase: {})",
                context.campaign.id, context.current_phase
            ))
        })?;

        if context.handoff_chain.contains(&stage) {
            return Err(CadenceError::Configuration(format!(
                "Stage '{}' already completed for campaign '{}'",
                stage, context.campaign.id
            )));
        }
        if context.handoff_chain.as_slice() != stage.predecessors() {
            return Err(CadenceError::ChainMismatch {
                expected: stage.predecessors().iter().map(|s| s.to_string()).collect(),
                found: context.handoff_chain.iter().map(|s| s.to_string()).collect(),
            });
        }

        let mut next = context.clone();
        next.phase_index += 1;
        next.handoff_chain.push(stage);
        next.current_phase = stage.next().map(Phase::from).unwrap_or(Phase::Orchestration);

        for (key, value) in &result.state {
            next.persistent_state.insert(key.clone(), value.clone());
        }

        let deliverables = Value::Object(result.output.deliverables.clone());
        next.previous_results
            .get_or_insert_with(JsonMap::new)
            .insert(stage.as_str().to_string(), deliverables.clone());

        let mut handoff = JsonMap::new();
        handoff.insert("stage".into(), Value::String(stage.as_str().to_string()));
        handoff.insert("deliverables".into(), deliverables);
        handoff.insert(
            "files".into(),
            Value::Array(
                result
                    .output
                    .files
                    .iter()
                    .map(|f| Value::String(f.clone()))
                    .collect(),
            ),
        );
        next.handoff_data = Some(handoff);

        debug!(
            campaign_id = %next.campaign.id,
            stage = %stage,
            phase_index = next.phase_index,
            "Enhanced context for handoff"
        );
        Ok(next)
    }

    /// Structural check of a context. No file I/O.
    pub fn validate_context(&self, context: &CampaignContext) -> ValidationResult {
        let mut result = ValidationResult::new();
        let campaign = &context.campaign;

        if context.request_id.trim().is_empty() {
            result.add_schema_error("requestId is empty");
        }
        if context.correlation_id.trim().is_empty() {
            result.add_schema_error("correlationId is empty");
        }
        if CampaignId::parse(campaign.id.as_str()).is_err() {
            result.add_schema_error(format!("campaign.id '{}' is not a valid id", campaign.id));
        }
        if campaign.storage_path.trim().is_empty() {
            result.add_schema_error("campaign.storagePath is empty");
        }
        if campaign.brand.trim().is_empty() {
            result.add_schema_error("campaign.brand is empty");
        }
        if campaign.language.trim().is_empty() {
            result.add_warning("campaign.language is empty");
        }

        if context.total_phases == 0 || context.total_phases > Stage::ALL.len() {
            result.add_schema_error(format!(
                "totalPhases {} outside 1..={}",
                context.total_phases,
                Stage::ALL.len()
            ));
        }
        if context.phase_index != context.handoff_chain.len() {
            result.add_schema_error(format!(
                "phaseIndex {} does not match handoffChain length {}",
                context.phase_index,
                context.handoff_chain.len()
            ));
        }

        let expected_prefix = &Stage::ALL[..context.handoff_chain.len().min(Stage::ALL.len())];
        if context.handoff_chain.len() > Stage::ALL.len()
            || context.handoff_chain.as_slice() != expected_prefix
        {
            result.add_schema_error(format!(
                "handoffChain {:?} is not a prefix of the pipeline order",
                context
                    .handoff_chain
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
            ));
        }

        match context.current_stage() {
            Some(stage) if context.handoff_chain.contains(&stage) => {
                result.add_schema_error(format!(
                    "currentPhase '{}' is already in handoffChain",
                    stage
                ));
            }
            Some(stage) if stage.index() != context.handoff_chain.len() => {
                result.add_schema_error(format!(
                    "currentPhase '{}' does not follow handoffChain",
                    stage
                ));
            }
            None if context.handoff_chain.len() != Stage::ALL.len() => {
                result.add_warning("context is in orchestration phase before the pipeline finished");
            }
            _ => {}
        }

        if context.timestamp > Utc::now() + chrono::Duration::minutes(5) {
            result.add_warning("context timestamp is in the future");
        }

        result
    }

    /// Check that `after` is a legal successor of `before`: the phase index
    /// never decreases and no recorded stage is lost.
    pub fn ensure_monotonic(before: &CampaignContext, after: &CampaignContext) -> Result<()> {
        if after.phase_index < before.phase_index {
            return Err(CadenceError::Configuration(format!(
                "phaseIndex went backwards ({} -> {})",
                before.phase_index, after.phase_index
            )));
        }
        if !after.handoff_chain.starts_with(&before.handoff_chain) {
            return Err(CadenceError::ChainMismatch {
                expected: before.handoff_chain.iter().map(|s| s.to_string()).collect(),
                found: after.handoff_chain.iter().map(|s| s.to_string()).collect(),
            });
        }
        Ok(())
    }

    fn identity_from_request(&self, request: &CampaignRequest) -> Result<CampaignIdentity> {
        let ident = &request.campaign;
        let id = required(ident.id.as_deref(), "campaign.id")?;
        let storage_path = required(ident.storage_path.as_deref(), "campaign.storagePath")?;
        let brand = required(ident.brand.as_deref(), "campaign.brand")?;

        Ok(CampaignIdentity {
            id: CampaignId::parse(&id)?,
            name: ident.name.clone().unwrap_or_default(),
            storage_path,
            brand,
            language: ident
                .language
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            campaign_type: ident.campaign_type.unwrap_or_default(),
        })
    }

    fn total_phases(&self, request: &CampaignRequest) -> Result<usize> {
        let total = match (request.total_phases, request.workflow_type.default_total_phases()) {
            (Some(n), _) => n,
            (None, Some(n)) => n,
            (None, None) => {
                return Err(CadenceError::Configuration(format!(
                    "workflow type {:?} requires an explicit totalPhases",
                    request.workflow_type
                )))
            }
        };
        if total == 0 || total > Stage::ALL.len() {
            return Err(CadenceError::Configuration(format!(
                "totalPhases {} outside 1..={}",
                total,
                Stage::ALL.len()
            )));
        }
        Ok(total)
    }
}

fn required(value: Option<&str>, field: &str) -> Result<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(CadenceError::Configuration(format!(
            "Missing required field: {}",
            field
        ))),
    }
}
