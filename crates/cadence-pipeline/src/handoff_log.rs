use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cadence_core::event::{EventBus, PipelineEvent};
use cadence_core::types::CampaignId;

/// File name of the per-campaign handoff log inside `logs/`.
pub const HANDOFF_LOG_FILE: &str = "handoffs.jsonl";

/// JSONL handoff logger.
///
/// Follows one campaign's events on the EventBus and appends one JSON object
/// per line to `<campaign>/logs/handoffs.jsonl`. Lines already written
/// survive a crash mid-run.
pub struct HandoffLogger {
    log_path: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    campaign_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    transition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl HandoffLogger {
    /// `level` controls verbosity: 1=campaign summary, 2=per handoff,
    /// 3=per validation layer.
    pub fn new(log_path: PathBuf, level: u8) -> Self {
        Self { log_path, level }
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Subscribe now and write in the background until cancellation or the
    /// campaign's terminal event.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        campaign_id: CampaignId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, campaign_id, cancel))
    }

    async fn run(
        self,
        mut rx: broadcast::Receiver<PipelineEvent>,
        campaign_id: CampaignId,
        cancel: CancellationToken,
    ) {
        if let Some(parent) = self.log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "Failed to create log directory");
                return;
            }
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %self.log_path.display(), "Failed to open handoff log");
                return;
            }
        };

        info!(path = %self.log_path.display(), campaign_id = %campaign_id, "HandoffLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.campaign_id() != &campaign_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write handoff log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush handoff log");
                                    }
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "HandoffLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, HandoffLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("HandoffLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %self.log_path.display(), "HandoffLogger finished");
    }

    /// Convert an event to a log entry (`None` if filtered by level).
    fn event_to_entry(&self, event: &PipelineEvent) -> Option<LogEntry> {
        let entry = |event_type: &'static str, transition: Option<&String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            campaign_id: event.campaign_id().to_string(),
            event_type,
            transition: transition.cloned(),
            detail,
        };

        match event {
            // L1: campaign summary
            PipelineEvent::CampaignStarted { campaign_path, .. } => Some(entry(
                "campaign_started",
                None,
                Some(serde_json::json!({ "campaign_path": campaign_path })),
            )),
            PipelineEvent::CampaignCompleted { .. } => Some(entry("campaign_completed", None, None)),
            PipelineEvent::CampaignHalted {
                transition,
                workflow_phase,
                findings,
                ..
            } => Some(entry(
                "campaign_halted",
                Some(transition),
                Some(serde_json::json!({
                    "workflow_phase": workflow_phase.as_str(),
                    "findings": findings,
                })),
            )),
            PipelineEvent::CampaignPaused { workflow_phase, .. } => Some(entry(
                "campaign_paused",
                None,
                Some(serde_json::json!({ "workflow_phase": workflow_phase.as_str() })),
            )),
            PipelineEvent::CampaignCancelled { workflow_phase, .. } => Some(entry(
                "campaign_cancelled",
                None,
                Some(serde_json::json!({ "workflow_phase": workflow_phase.as_str() })),
            )),
            PipelineEvent::ContinuityAnalyzed {
                score,
                critical_issues,
                ..
            } => Some(entry(
                "continuity_analyzed",
                None,
                Some(serde_json::json!({
                    "score": score,
                    "critical_issues": critical_issues,
                })),
            )),

            // L2: per handoff
            PipelineEvent::HandoffCommitted {
                transition,
                handoff_id,
                path,
                bytes,
                ..
            } if self.level >= 2 => Some(entry(
                "handoff_committed",
                Some(transition),
                Some(serde_json::json!({
                    "handoff_id": handoff_id,
                    "path": path,
                    "bytes": bytes,
                })),
            )),
            PipelineEvent::HandoffSuperseded {
                transition,
                archived_as,
                ..
            } if self.level >= 2 => Some(entry(
                "handoff_superseded",
                Some(transition),
                Some(serde_json::json!({ "archived_as": archived_as })),
            )),
            PipelineEvent::ValidationCompleted {
                transition,
                result,
                elapsed_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "validation_completed",
                Some(transition),
                Some(serde_json::json!({
                    "is_valid": result.is_valid,
                    "findings": result.blocking_count(),
                    "warnings": result.warnings.len(),
                    "elapsed_ms": elapsed_ms,
                })),
            )),
            PipelineEvent::HandoffRecorded { metrics } if self.level >= 2 => {
                let transition = metrics.transition();
                Some(entry(
                    "handoff_recorded",
                    Some(&transition),
                    serde_json::to_value(metrics).ok(),
                ))
            }

            // L3: per validation layer
            PipelineEvent::ValidationLayerCompleted {
                transition,
                layer,
                passed,
                elapsed_ms,
                ..
            } if self.level >= 3 => Some(entry(
                "validation_layer",
                Some(transition),
                Some(serde_json::json!({
                    "layer": layer.as_str(),
                    "passed": passed,
                    "elapsed_ms": elapsed_ms,
                })),
            )),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::Phase;

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_writes_campaign_events_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join(HANDOFF_LOG_FILE);
        let bus = Arc::new(EventBus::new(32));
        let c1 = CampaignId("c1".into());

        let handle = HandoffLogger::new(path.clone(), 2).spawn(&bus, c1.clone(), CancellationToken::new());

        bus.publish(PipelineEvent::CampaignStarted {
            campaign_id: c1.clone(),
            campaign_path: "campaigns/c1/".into(),
        });
        bus.publish(PipelineEvent::CampaignStarted {
            campaign_id: CampaignId("other".into()),
            campaign_path: "campaigns/other/".into(),
        });
        bus.publish(PipelineEvent::HandoffCommitted {
            campaign_id: c1.clone(),
            transition: "data-to-content".into(),
            handoff_id: "h1".into(),
            path: "p".into(),
            bytes: 10,
        });
        bus.publish(PipelineEvent::ValidationLayerCompleted {
            campaign_id: c1.clone(),
            transition: "data-to-content".into(),
            layer: cadence_core::report::ValidationLayer::Schema,
            passed: true,
            elapsed_ms: 1,
        });
        bus.publish(PipelineEvent::CampaignHalted {
            campaign_id: c1.clone(),
            transition: "content-to-design".into(),
            workflow_phase: Phase::Content,
            findings: vec!["missing dependency: pricing-analysis.json".into()],
        });

        handle.await.unwrap();

        let lines = read_lines(&path);
        let types: Vec<&str> = lines
            .iter()
            .map(|l| l["event_type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["campaign_started", "handoff_committed", "campaign_halted"]);
        assert_eq!(lines[2]["detail"]["workflow_phase"], "content");
        assert_eq!(lines[2]["transition"], "content-to-design");
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HANDOFF_LOG_FILE);
        let bus = Arc::new(EventBus::new(8));
        let cancel = CancellationToken::new();

        let handle = HandoffLogger::new(path.clone(), 1).spawn(&bus, CampaignId("c1".into()), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
