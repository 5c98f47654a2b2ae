use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};

use cadence_core::config::{AppConfig, ContinuityConfig, ValidationConfig};
use cadence_core::envelope::{HandoffEnvelope, StageOutput};
use cadence_core::error::Result;
use cadence_core::event::{EventBus, PipelineEvent};
use cadence_core::report::{
    ContinuityIssue, ContinuityReport, IssueSeverity, IssueType, TransitionScore,
};
use cadence_core::types::Stage;

use crate::store::CampaignStore;

/// Scores how much information survives each transition of an envelope
/// chain. Diagnostic only: nothing here gates the pipeline.
pub struct ContinuityAnalyzer {
    weights: (f64, f64, f64),
    threshold: f64,
    critical_gap: f64,
    validation: ValidationConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl ContinuityAnalyzer {
    pub fn new(continuity: &ContinuityConfig, validation: &ValidationConfig) -> Result<Self> {
        Ok(Self {
            weights: continuity.normalized_weights()?,
            threshold: continuity.threshold,
            critical_gap: continuity.critical_gap,
            validation: validation.clone(),
            event_bus: None,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(&config.continuity, &config.validation)
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Analyze a chain of envelopes given in pipeline order.
    ///
    /// Each envelope is scored against its predecessor; the first one is
    /// scored against an empty start. An empty chain scores 100.
    pub fn analyze(&self, chain: &[HandoffEnvelope]) -> ContinuityReport {
        let mut transitions = Vec::with_capacity(chain.len());
        let mut issues = Vec::new();

        for (i, envelope) in chain.iter().enumerate() {
            let prior = i.checked_sub(1).map(|p| &chain[p]);
            let score = self.score_transition(prior, envelope, &mut issues);

            if score.score < self.threshold {
                let gap = self.threshold - score.score;
                issues.push(ContinuityIssue {
                    severity: IssueSeverity::from_gap(gap, self.critical_gap),
                    issue_type: weakest_component(&score),
                    transition: score.transition.clone(),
                    stage: score.stage,
                    description: format!(
                        "score {:.1} is {:.1} below threshold {:.0} (fields {:.0}%, non-empty {:.0}%, preserved {:.0}%)",
                        score.score,
                        gap,
                        self.threshold,
                        score.field_presence * 100.0,
                        score.non_empty_ratio * 100.0,
                        score.preservation * 100.0
                    ),
                });
            }
            transitions.push(score);
        }

        let continuity_score = if transitions.is_empty() {
            100.0
        } else {
            transitions.iter().map(|t| t.score).sum::<f64>() / transitions.len() as f64
        };

        issues.sort_by_key(|i| i.severity);
        let recommendations = recommendations(&issues);

        ContinuityReport {
            campaign_id: chain.first().map(|e| e.handoff_info.campaign_id.clone()),
            generated_at: Utc::now(),
            transitions,
            continuity_score: continuity_score.clamp(0.0, 100.0),
            continuity_issues: issues,
            recommendations,
        }
    }

    /// Load a campaign's committed chain and analyze it.
    pub async fn analyze_store(&self, store: &CampaignStore) -> Result<ContinuityReport> {
        let chain = store.load_chain().await?;
        Ok(self.analyze(&chain))
    }

    /// Log the report for operators and publish it on the event bus.
    /// Critical findings are logged at error level.
    pub fn surface(&self, report: &ContinuityReport) {
        let campaign = report
            .campaign_id
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_default();

        for issue in &report.continuity_issues {
            match issue.severity {
                IssueSeverity::Critical => error!(
                    campaign_id = %campaign,
                    transition = %issue.transition,
                    issue = ?issue.issue_type,
                    "Critical continuity issue: {}",
                    issue.description
                ),
                IssueSeverity::High | IssueSeverity::Medium => warn!(
                    campaign_id = %campaign,
                    transition = %issue.transition,
                    issue = ?issue.issue_type,
                    severity = ?issue.severity,
                    "Continuity degraded: {}",
                    issue.description
                ),
                IssueSeverity::Low => info!(
                    campaign_id = %campaign,
                    transition = %issue.transition,
                    "Minor continuity gap: {}",
                    issue.description
                ),
            }
        }
        info!(
            campaign_id = %campaign,
            score = report.continuity_score,
            transitions = report.transitions.len(),
            issues = report.continuity_issues.len(),
            "Continuity analyzed"
        );

        if let (Some(bus), Some(campaign_id)) = (&self.event_bus, &report.campaign_id) {
            bus.publish(PipelineEvent::ContinuityAnalyzed {
                campaign_id: campaign_id.clone(),
                score: report.continuity_score,
                critical_issues: report.critical_issues().count(),
            });
        }
    }

    fn score_transition(
        &self,
        prior: Option<&HandoffEnvelope>,
        envelope: &HandoffEnvelope,
        issues: &mut Vec<ContinuityIssue>,
    ) -> TransitionScore {
        let stage = envelope.source_stage();
        let transition = envelope.transition_name();
        let previous_stage = prior.map(|p| p.source_stage());

        if let Some(prev) = previous_stage {
            if prev.next() != Some(stage) {
                issues.push(ContinuityIssue {
                    severity: IssueSeverity::Critical,
                    issue_type: IssueType::ContextLoss,
                    transition: transition.clone(),
                    stage,
                    description: format!("chain jumps from '{}' to '{}'", prev, stage),
                });
            }
        }

        let empty = StageOutput::new();
        let contribution = match envelope.contribution() {
            Some(output) => output,
            None => {
                issues.push(ContinuityIssue {
                    severity: IssueSeverity::Critical,
                    issue_type: IssueType::DataLoss,
                    transition: transition.clone(),
                    stage,
                    description: format!("envelope carries no output for its source stage '{}'", stage),
                });
                &empty
            }
        };

        let field_presence = self.field_presence(stage, contribution);
        let non_empty_ratio = non_empty_ratio(contribution);
        let preservation = match prior {
            Some(prior) => {
                detect_data_loss(prior, envelope, &transition, issues);
                detect_identity_drift(prior, envelope, &transition, issues);
                preservation_ratio(prior, envelope)
            }
            None => 1.0,
        };

        let (wf, wn, wp) = self.weights;
        let score = (100.0 * (wf * field_presence + wn * non_empty_ratio + wp * preservation))
            .clamp(0.0, 100.0);

        TransitionScore {
            transition,
            stage,
            previous_stage,
            field_presence,
            non_empty_ratio,
            preservation,
            score,
        }
    }

    fn field_presence(&self, stage: Stage, output: &StageOutput) -> f64 {
        let required = self.validation.required_fields_for(stage);
        if required.is_empty() {
            return 1.0;
        }
        let present = required
            .iter()
            .filter(|f| output.get(f).map(|v| !is_empty_value(v)).unwrap_or(false))
            .count();
        present as f64 / required.len() as f64
    }
}

/// Share of non-empty leaves in the deliverables. No leaves at all counts
/// as fully empty.
fn non_empty_ratio(output: &StageOutput) -> f64 {
    let (mut filled, mut total) = (0usize, 0usize);
    for value in output.deliverables.values() {
        count_leaves(value, &mut filled, &mut total);
    }
    if total == 0 {
        0.0
    } else {
        filled as f64 / total as f64
    }
}

fn count_leaves(value: &Value, filled: &mut usize, total: &mut usize) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for v in map.values() {
                count_leaves(v, filled, total);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for v in items {
                count_leaves(v, filled, total);
            }
        }
        other => {
            *total += 1;
            if !is_empty_value(other) {
                *filled += 1;
            }
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Share of the prior envelope's preserved paths that still hold the same
/// value in the next envelope. Nothing flagged means nothing to lose.
fn preservation_ratio(prior: &HandoffEnvelope, next: &HandoffEnvelope) -> f64 {
    let (mut kept, mut total) = (0usize, 0usize);
    for (stage, prior_output) in prior.specialist_outputs.iter() {
        for path in &prior_output.preserve {
            total += 1;
            let before = prior_output.lookup(path);
            let after = next
                .specialist_outputs
                .get(stage)
                .and_then(|o| o.lookup(path));
            if before.is_some() && before == after {
                kept += 1;
            }
        }
    }
    if total == 0 {
        1.0
    } else {
        kept as f64 / total as f64
    }
}

fn detect_data_loss(
    prior: &HandoffEnvelope,
    next: &HandoffEnvelope,
    transition: &str,
    issues: &mut Vec<ContinuityIssue>,
) {
    for (stage, prior_output) in prior.specialist_outputs.iter() {
        let description = match next.specialist_outputs.get(stage) {
            None => format!("output of '{}' was dropped from the chain", stage),
            Some(output) if output != prior_output => {
                format!("output of '{}' changed after it was handed off", stage)
            }
            Some(_) => continue,
        };
        issues.push(ContinuityIssue {
            severity: IssueSeverity::Critical,
            issue_type: IssueType::DataLoss,
            transition: transition.to_string(),
            stage,
            description,
        });
    }
}

fn detect_identity_drift(
    prior: &HandoffEnvelope,
    next: &HandoffEnvelope,
    transition: &str,
    issues: &mut Vec<ContinuityIssue>,
) {
    let (a, b) = (&prior.campaign_context, &next.campaign_context);
    let mut drifted = Vec::new();
    if a.id != b.id {
        drifted.push("id");
    }
    if a.brand != b.brand {
        drifted.push("brand");
    }
    if a.language != b.language {
        drifted.push("language");
    }
    if a.campaign_type != b.campaign_type {
        drifted.push("type");
    }
    if prior.handoff_info.trace_id != next.handoff_info.trace_id {
        drifted.push("trace_id");
    }
    if drifted.is_empty() {
        return;
    }
    issues.push(ContinuityIssue {
        severity: IssueSeverity::High,
        issue_type: IssueType::ContextLoss,
        transition: transition.to_string(),
        stage: next.source_stage(),
        description: format!("campaign context changed: {}", drifted.join(", ")),
    });
}

fn weakest_component(score: &TransitionScore) -> IssueType {
    let components = [
        (score.field_presence, IssueType::SpecificationDrift),
        (score.non_empty_ratio, IssueType::QualityDegradation),
        (score.preservation, IssueType::ContextLoss),
    ];
    components
        .iter()
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, t)| *t)
        .unwrap_or(IssueType::QualityDegradation)
}

fn recommendations(issues: &[ContinuityIssue]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for issue in issues {
        let text = match issue.issue_type {
            IssueType::DataLoss => format!(
                "Re-run '{}' from the last valid envelope; earlier stage outputs must pass through unchanged",
                issue.stage
            ),
            IssueType::SpecificationDrift => format!(
                "Check that '{}' returns every required deliverable",
                issue.stage
            ),
            IssueType::QualityDegradation => format!(
                "Review empty or placeholder values in the '{}' output",
                issue.stage
            ),
            IssueType::ContextLoss => format!(
                "Carry preserved fields and campaign identity through {}",
                issue.transition
            ),
        };
        if !out.contains(&text) {
            out.push(text);
        }
    }
    out
}
