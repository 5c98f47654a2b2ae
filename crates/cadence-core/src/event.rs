use crate::metrics::HandoffMetrics;
use crate::report::{ValidationLayer, ValidationResult};
use crate::types::{CampaignId, Phase};

/// Pipeline event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A campaign context was created and its directory prepared.
    CampaignStarted {
        campaign_id: CampaignId,
        campaign_path: String,
    },
    /// An envelope was atomically committed.
    HandoffCommitted {
        campaign_id: CampaignId,
        transition: String,
        handoff_id: String,
        path: String,
        bytes: u64,
    },
    /// A previous envelope for the same transition was archived.
    HandoffSuperseded {
        campaign_id: CampaignId,
        transition: String,
        archived_as: String,
    },
    /// One validator layer finished.
    ValidationLayerCompleted {
        campaign_id: CampaignId,
        transition: String,
        layer: ValidationLayer,
        passed: bool,
        elapsed_ms: u64,
    },
    /// All four layers finished and were merged.
    ValidationCompleted {
        campaign_id: CampaignId,
        transition: String,
        result: ValidationResult,
        elapsed_ms: u64,
    },
    /// Metrics for one handoff attempt.
    HandoffRecorded { metrics: HandoffMetrics },
    /// The pipeline stopped on a rejected transition.
    CampaignHalted {
        campaign_id: CampaignId,
        transition: String,
        workflow_phase: Phase,
        findings: Vec<String>,
    },
    /// Every stage handed off successfully.
    CampaignCompleted { campaign_id: CampaignId },
    /// A partial workflow finished its planned stages before the pipeline end.
    CampaignPaused {
        campaign_id: CampaignId,
        workflow_phase: Phase,
    },
    /// The campaign was cancelled between or during stages.
    CampaignCancelled {
        campaign_id: CampaignId,
        workflow_phase: Phase,
    },
    /// Continuity analysis finished for the chain.
    ContinuityAnalyzed {
        campaign_id: CampaignId,
        score: f64,
        critical_issues: usize,
    },
}

impl PipelineEvent {
    pub fn campaign_id(&self) -> &CampaignId {
        match self {
            Self::CampaignStarted { campaign_id, .. }
            | Self::HandoffCommitted { campaign_id, .. }
            | Self::HandoffSuperseded { campaign_id, .. }
            | Self::ValidationLayerCompleted { campaign_id, .. }
            | Self::ValidationCompleted { campaign_id, .. }
            | Self::CampaignHalted { campaign_id, .. }
            | Self::CampaignCompleted { campaign_id }
            | Self::CampaignPaused { campaign_id, .. }
            | Self::CampaignCancelled { campaign_id, .. }
            | Self::ContinuityAnalyzed { campaign_id, .. } => campaign_id,
            Self::HandoffRecorded { metrics } => &metrics.campaign_id,
        }
    }

    /// Whether this event ends the campaign's run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CampaignHalted { .. }
                | Self::CampaignCompleted { .. }
                | Self::CampaignPaused { .. }
                | Self::CampaignCancelled { .. }
        )
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
