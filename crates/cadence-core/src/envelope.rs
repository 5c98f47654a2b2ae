use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CadenceError, Result};
use crate::types::{
    transition_name, CampaignId, CampaignType, JsonMap, Stage, WorkflowType, COMPLETE_LABEL,
};

/// Envelope format written by this crate.
pub const FORMAT_VERSION: &str = "1.0";

/// Deliverables declared by one stage.
///
/// `files` and `preserve` are reserved keys; everything else is the stage's
/// own deliverable map, flattened into the same JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// File dependencies, relative to the campaign root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Dot-paths into `deliverables` that later stages must carry unchanged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preserve: Vec<String>,
    #[serde(flatten)]
    pub deliverables: JsonMap,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a plain JSON object. Reserved keys are lifted out.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(CadenceError::Configuration(
                "Stage output must be a JSON object".into(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.deliverables.insert(key.into(), value);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn with_preserved(mut self, path: impl Into<String>) -> Self {
        self.preserve.push(path.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.deliverables.get(key)
    }

    /// Look up a dot-separated path (`market.region`) in the deliverables.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.deliverables.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Serialized size in bytes.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// A stage worker's complete result: deliverables plus state updates that
/// belong to the campaign context rather than the envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageResult {
    pub output: StageOutput,
    pub state: JsonMap,
}

impl StageResult {
    pub fn new(output: StageOutput) -> Self {
        Self {
            output,
            state: JsonMap::new(),
        }
    }

    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }
}

/// Outputs accumulated across stages, keyed by stage name.
///
/// One typed slot per stage keeps the key set statically checkable against
/// the handoff chain. Slots are filled once and never replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialistOutputs {
    #[serde(rename = "data-collection", default, skip_serializing_if = "Option::is_none")]
    pub data_collection: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<StageOutput>,
}

impl SpecialistOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, stage: Stage) -> &Option<StageOutput> {
        match stage {
            Stage::DataCollection => &self.data_collection,
            Stage::Content => &self.content,
            Stage::Design => &self.design,
            Stage::Quality => &self.quality,
            Stage::Delivery => &self.delivery,
        }
    }

    fn slot_mut(&mut self, stage: Stage) -> &mut Option<StageOutput> {
        match stage {
            Stage::DataCollection => &mut self.data_collection,
            Stage::Content => &mut self.content,
            Stage::Design => &mut self.design,
            Stage::Quality => &mut self.quality,
            Stage::Delivery => &mut self.delivery,
        }
    }

    pub fn get(&self, stage: Stage) -> Option<&StageOutput> {
        self.slot(stage).as_ref()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.slot(stage).is_some()
    }

    /// Record a stage's output. Fails if the stage already has one.
    pub fn insert(&mut self, stage: Stage, output: StageOutput) -> Result<()> {
        let slot = self.slot_mut(stage);
        if slot.is_some() {
            return Err(CadenceError::Configuration(format!(
                "Outputs for stage '{}' are already recorded and cannot be replaced",
                stage
            )));
        }
        *slot = Some(output);
        Ok(())
    }

    /// Stages with recorded outputs, in pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        self.iter().map(|(stage, _)| stage).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &StageOutput)> + '_ {
        Stage::ALL
            .into_iter()
            .filter_map(move |stage| self.get(stage).map(|out| (stage, out)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transfer metadata for one handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffInfo {
    pub source_stage: Stage,
    /// `None` for the terminal handoff out of delivery.
    pub target_stage: Option<Stage>,
    pub handoff_id: String,
    pub created_at: DateTime<Utc>,
    pub campaign_id: CampaignId,
    pub campaign_path: String,
    pub trace_id: Option<String>,
    pub format_version: String,
    #[serde(default)]
    pub execution_duration_ms: Option<u64>,
}

/// Denormalized copy of the campaign identity, for humans reading the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub id: CampaignId,
    pub name: String,
    pub brand: String,
    pub language: String,
    #[serde(rename = "type")]
    pub campaign_type: CampaignType,
    pub storage_path: String,
    pub request_id: String,
    pub correlation_id: String,
    pub workflow_type: WorkflowType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub completed_stages: Vec<Stage>,
    pub current_stage: Stage,
    pub next_stage: Option<Stage>,
    pub phase: String,
    pub completion_percentage: f64,
}

/// The durable record exchanged between two adjacent stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffEnvelope {
    pub handoff_info: HandoffInfo,
    pub campaign_context: CampaignSnapshot,
    pub specialist_outputs: SpecialistOutputs,
    pub workflow_status: WorkflowStatus,
}

impl HandoffEnvelope {
    pub fn source_stage(&self) -> Stage {
        self.handoff_info.source_stage
    }

    pub fn target_stage(&self) -> Option<Stage> {
        self.handoff_info.target_stage
    }

    pub fn transition_name(&self) -> String {
        transition_name(self.handoff_info.source_stage, self.handoff_info.target_stage)
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.transition_name())
    }

    /// Label of the target, `complete` for the terminal handoff.
    pub fn target_label(&self) -> &'static str {
        self.handoff_info
            .target_stage
            .map(Stage::file_label)
            .unwrap_or(COMPLETE_LABEL)
    }

    /// The output contributed by the source stage of this handoff.
    pub fn contribution(&self) -> Option<&StageOutput> {
        self.specialist_outputs.get(self.handoff_info.source_stage)
    }

    /// Serialized size in bytes (pretty-printed, as written to disk).
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec_pretty(self).map(|v| v.len()).unwrap_or(0)
    }
}
