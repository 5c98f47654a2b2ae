use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CadenceError, Result};

/// JSON object used for free-form stage deliverables and state.
pub type JsonMap = Map<String, Value>;

fn campaign_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("campaign id pattern is valid")
    })
}

/// Unique campaign identifier (also the directory name under `campaigns/`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub String);

impl CampaignId {
    /// Generate a fresh id of the form `campaign_<unix-millis>_<hex>`.
    pub fn generate() -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
        Self(format!(
            "campaign_{}_{:06x}",
            Utc::now().timestamp_millis(),
            suffix
        ))
    }

    /// Parse and validate an id. Ids are used verbatim as directory names,
    /// so separators and leading dots are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if campaign_id_pattern().is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(CadenceError::Configuration(format!(
                "Invalid campaign id '{}'",
                s
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the five specialist stages, in pipeline order.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    DataCollection,
    Content,
    Design,
    Quality,
    Delivery,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::DataCollection,
        Stage::Content,
        Stage::Design,
        Stage::Quality,
        Stage::Delivery,
    ];

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        match self {
            Self::DataCollection => 0,
            Self::Content => 1,
            Self::Design => 2,
            Self::Quality => 3,
            Self::Delivery => 4,
        }
    }

    pub fn first() -> Self {
        Self::DataCollection
    }

    pub fn is_first(self) -> bool {
        self == Self::DataCollection
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Delivery
    }

    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// Stages that must have completed before this one starts.
    pub fn predecessors(self) -> &'static [Stage] {
        &Self::ALL[..self.index()]
    }

    /// Canonical stage name (`data-collection`, `content`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataCollection => "data-collection",
            Self::Content => "content",
            Self::Design => "design",
            Self::Quality => "quality",
            Self::Delivery => "delivery",
        }
    }

    /// Short label used in handoff file names (`data-to-content.json`).
    pub fn file_label(self) -> &'static str {
        match self {
            Self::DataCollection => "data",
            Self::Content => "content",
            Self::Design => "design",
            Self::Quality => "quality",
            Self::Delivery => "delivery",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "data-collection" | "data_collection" | "data" => Ok(Self::DataCollection),
            "content" => Ok(Self::Content),
            "design" => Ok(Self::Design),
            "quality" => Ok(Self::Quality),
            "delivery" => Ok(Self::Delivery),
            other => Err(CadenceError::Configuration(format!(
                "Unknown stage '{}'",
                other
            ))),
        }
    }
}

/// Label of the pseudo-target after the terminal stage.
pub const COMPLETE_LABEL: &str = "complete";

/// Name of the transition `from -> to`, e.g. `data-to-content`.
/// A `None` target denotes the terminal handoff (`delivery-to-complete`).
pub fn transition_name(from: Stage, to: Option<Stage>) -> String {
    format!(
        "{}-to-{}",
        from.file_label(),
        to.map(Stage::file_label).unwrap_or(COMPLETE_LABEL)
    )
}

/// File name of the envelope for `from -> to`.
pub fn handoff_file_name(from: Stage, to: Option<Stage>) -> String {
    format!("{}.json", transition_name(from, to))
}

/// Where the workflow currently is: a stage, or the orchestrator itself.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    DataCollection,
    Content,
    Design,
    Quality,
    Delivery,
    Orchestration,
}

impl Phase {
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::DataCollection => Some(Stage::DataCollection),
            Self::Content => Some(Stage::Content),
            Self::Design => Some(Stage::Design),
            Self::Quality => Some(Stage::Quality),
            Self::Delivery => Some(Stage::Delivery),
            Self::Orchestration => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self.stage() {
            Some(stage) => stage.as_str(),
            None => "orchestration",
        }
    }
}

impl From<Stage> for Phase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::DataCollection => Self::DataCollection,
            Stage::Content => Self::Content,
            Stage::Design => Self::Design,
            Stage::Quality => Self::Quality,
            Stage::Delivery => Self::Delivery,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of workflow a campaign runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    #[default]
    FullPipeline,
    SingleStage,
    Test,
    Partial,
}

impl WorkflowType {
    /// Phase count implied by the workflow type. Partial workflows have none
    /// and must state their phase count explicitly.
    pub fn default_total_phases(self) -> Option<usize> {
        match self {
            Self::FullPipeline | Self::Test => Some(Stage::ALL.len()),
            Self::SingleStage => Some(1),
            Self::Partial => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignType {
    #[default]
    Promotional,
    Transactional,
    Newsletter,
    Announcement,
}

/// Campaign identity fields carried by every context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignIdentity {
    pub id: CampaignId,
    pub name: String,
    pub storage_path: String,
    pub brand: String,
    pub language: String,
    #[serde(rename = "type")]
    pub campaign_type: CampaignType,
}

/// The run-scoped state object threaded through every stage.
///
/// Values are replaced, never mutated in place: the context manager hands
/// back a new context at every handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignContext {
    // Identity
    pub request_id: String,
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,

    // Workflow position
    pub workflow_type: WorkflowType,
    pub current_phase: Phase,
    pub total_phases: usize,
    pub phase_index: usize,

    // Campaign identity
    pub campaign: CampaignIdentity,

    // Data flow
    pub previous_results: Option<JsonMap>,
    pub handoff_data: Option<JsonMap>,
    #[serde(default)]
    pub persistent_state: JsonMap,
    #[serde(default)]
    pub handoff_chain: Vec<Stage>,
}

impl CampaignContext {
    pub fn campaign_id(&self) -> &CampaignId {
        &self.campaign.id
    }

    /// The stage currently running, if the context is positioned on one.
    pub fn current_stage(&self) -> Option<Stage> {
        self.current_phase.stage()
    }

    /// Completion percentage implied by the handoff chain.
    pub fn completion_percentage(&self) -> f64 {
        completion_percentage(self.handoff_chain.len(), self.total_phases)
    }

    pub fn is_complete(&self) -> bool {
        self.total_phases > 0 && self.handoff_chain.len() >= self.total_phases
    }
}

/// `100 * completed / total`, clamped to `[0, 100]`. Zero total yields zero.
pub fn completion_percentage(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 * 100.0 / total as f64).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_navigation() {
        assert_eq!(Stage::DataCollection.next(), Some(Stage::Content));
        assert_eq!(Stage::Delivery.next(), None);
        assert_eq!(Stage::DataCollection.previous(), None);
        assert_eq!(Stage::Quality.previous(), Some(Stage::Design));
        assert_eq!(
            Stage::Design.predecessors(),
            &[Stage::DataCollection, Stage::Content]
        );
        assert!(Stage::DataCollection < Stage::Delivery);
    }

    #[test]
    fn test_stage_serde_names() {
        let json = serde_json::to_string(&Stage::DataCollection).unwrap();
        assert_eq!(json, "\"data-collection\"");
        let stage: Stage = serde_json::from_str("\"quality\"").unwrap();
        assert_eq!(stage, Stage::Quality);
        assert_eq!("data".parse::<Stage>().unwrap(), Stage::DataCollection);
        assert!("render".parse::<Stage>().is_err());
    }

    #[test]
    fn test_transition_file_names() {
        assert_eq!(
            handoff_file_name(Stage::DataCollection, Some(Stage::Content)),
            "data-to-content.json"
        );
        assert_eq!(
            handoff_file_name(Stage::Content, Some(Stage::Design)),
            "content-to-design.json"
        );
        assert_eq!(
            transition_name(Stage::Delivery, None),
            "delivery-to-complete"
        );
    }

    #[test]
    fn test_completion_percentage_exact() {
        for completed in 0..=5 {
            assert_eq!(
                completion_percentage(completed, 5),
                completed as f64 * 20.0
            );
        }
        assert_eq!(completion_percentage(3, 0), 0.0);
        assert_eq!(completion_percentage(7, 5), 100.0);
    }

    #[test]
    fn test_campaign_id_validation() {
        assert!(CampaignId::parse("campaign_1000_abc").is_ok());
        assert!(CampaignId::parse("../etc").is_err());
        assert!(CampaignId::parse("a/b").is_err());
        assert!(CampaignId::parse("").is_err());

        let generated = CampaignId::generate();
        assert!(generated.as_str().starts_with("campaign_"));
        assert!(CampaignId::parse(generated.as_str()).is_ok());
    }

    #[test]
    fn test_phase_from_stage() {
        assert_eq!(Phase::from(Stage::Design).stage(), Some(Stage::Design));
        assert_eq!(Phase::Orchestration.stage(), None);
        assert_eq!(
            serde_json::to_string(&Phase::Orchestration).unwrap(),
            "\"orchestration\""
        );
    }

    #[test]
    fn test_workflow_default_phases() {
        assert_eq!(WorkflowType::FullPipeline.default_total_phases(), Some(5));
        assert_eq!(WorkflowType::SingleStage.default_total_phases(), Some(1));
        assert_eq!(WorkflowType::Partial.default_total_phases(), None);
    }
}
