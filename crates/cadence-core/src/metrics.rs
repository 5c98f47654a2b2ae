use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{transition_name, CampaignId, Stage};

/// Timing and size of a single handoff attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffMetrics {
    pub handoff_id: String,
    pub campaign_id: CampaignId,
    pub source_stage: Stage,
    pub target_stage: Option<Stage>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Build duration (envelope assembly and commit), in milliseconds.
    pub duration_ms: u64,
    pub data_size_bytes: u64,
    pub validation_duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandoffMetrics {
    pub fn transition(&self) -> String {
        transition_name(self.source_stage, self.target_stage)
    }

    /// Build plus validation time.
    pub fn total_ms(&self) -> u64 {
        self.duration_ms + self.validation_duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowHandoff,
    LargePayload,
    HandoffFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub handoff_id: String,
    pub transition: String,
    pub message: String,
}

/// Aggregates for one `(from, to)` transition within a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionStats {
    pub transition: String,
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    pub average_duration_ms: f64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Campaign-level roll-up of every recorded handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffSummary {
    pub campaign_id: CampaignId,
    pub total_handoffs: usize,
    pub successful_handoffs: usize,
    pub failed_handoffs: usize,
    /// Percentage of successful handoffs (0..=100). 100 when nothing recorded.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub max_duration_ms: u64,
    pub average_validation_ms: f64,
    pub total_bytes_transferred: u64,
    /// Source stages of successful handoffs, in the order they happened.
    pub handoff_chain: Vec<Stage>,
    pub transitions: Vec<TransitionStats>,
    pub alerts: Vec<PerformanceAlert>,
}

impl HandoffSummary {
    pub fn empty(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id,
            total_handoffs: 0,
            successful_handoffs: 0,
            failed_handoffs: 0,
            success_rate: 100.0,
            average_duration_ms: 0.0,
            max_duration_ms: 0,
            average_validation_ms: 0.0,
            total_bytes_transferred: 0,
            handoff_chain: vec![],
            transitions: vec![],
            alerts: vec![],
        }
    }
}
