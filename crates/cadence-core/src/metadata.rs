use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CampaignContext, CampaignId, Phase, Stage};

/// File name of the per-campaign metadata record.
pub const METADATA_FILE: &str = "campaign-metadata.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Created,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Contents of `campaign-metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignMetadata {
    pub id: CampaignId,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub brand: String,
    pub status: CampaignStatus,
    pub workflow_phase: Phase,
    pub specialists_completed: BTreeMap<Stage, bool>,
    pub trace_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Transition that halted the campaign, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_transition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_errors: Vec<String>,
}

impl CampaignMetadata {
    /// Fresh metadata for a newly created context.
    pub fn for_context(ctx: &CampaignContext) -> Self {
        Self {
            id: ctx.campaign.id.clone(),
            created_at: ctx.timestamp,
            name: ctx.campaign.name.clone(),
            brand: ctx.campaign.brand.clone(),
            status: CampaignStatus::Created,
            workflow_phase: ctx.current_phase,
            specialists_completed: Stage::ALL.iter().map(|s| (*s, false)).collect(),
            trace_id: ctx.trace_id.clone(),
            updated_at: None,
            failed_transition: None,
            last_errors: vec![],
        }
    }

    /// Record a successful handoff out of `stage`.
    pub fn mark_stage_completed(&mut self, stage: Stage, next_phase: Phase) {
        self.specialists_completed.insert(stage, true);
        self.workflow_phase = next_phase;
        self.status = if stage.is_terminal() {
            CampaignStatus::Completed
        } else {
            CampaignStatus::InProgress
        };
        self.updated_at = Some(Utc::now());
    }

    /// Record a halted transition with its findings.
    pub fn mark_failed(&mut self, transition: impl Into<String>, errors: Vec<String>) {
        self.status = CampaignStatus::Failed;
        self.failed_transition = Some(transition.into());
        self.last_errors = errors;
        self.updated_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = CampaignStatus::Cancelled;
        self.updated_at = Some(Utc::now());
    }

    pub fn completed_stages(&self) -> Vec<Stage> {
        self.specialists_completed
            .iter()
            .filter(|(_, done)| **done)
            .map(|(stage, _)| *stage)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CampaignMetadata {
        CampaignMetadata {
            id: CampaignId("campaign_1000_abc".into()),
            created_at: Utc::now(),
            name: "Spring".into(),
            brand: "Acme".into(),
            status: CampaignStatus::Created,
            workflow_phase: Phase::DataCollection,
            specialists_completed: Stage::ALL.iter().map(|s| (*s, false)).collect(),
            trace_id: None,
            updated_at: None,
            failed_transition: None,
            last_errors: vec![],
        }
    }

    #[test]
    fn test_stage_completion_transitions_status() {
        let mut meta = sample();
        meta.mark_stage_completed(Stage::DataCollection, Phase::Content);
        assert_eq!(meta.status, CampaignStatus::InProgress);
        assert_eq!(meta.workflow_phase, Phase::Content);
        assert_eq!(meta.completed_stages(), vec![Stage::DataCollection]);

        meta.mark_stage_completed(Stage::Delivery, Phase::Orchestration);
        assert_eq!(meta.status, CampaignStatus::Completed);
        assert!(meta.status.is_terminal());
    }

    #[test]
    fn test_failed_metadata_serializes_diagnostics() {
        let mut meta = sample();
        meta.mark_failed("content-to-design", vec!["missing dependency: a.json".into()]);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["failed_transition"], "content-to-design");
        assert_eq!(value["specialists_completed"]["data-collection"], false);
    }
}
