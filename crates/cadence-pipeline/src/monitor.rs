use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use cadence_core::config::{AppConfig, MonitorConfig};
use cadence_core::event::{EventBus, PipelineEvent};
use cadence_core::metrics::{
    AlertKind, HandoffMetrics, HandoffSummary, PerformanceAlert, TransitionStats,
};
use cadence_core::types::{CampaignId, Stage};

use crate::metrics_store::MetricsStore;

/// Records per-handoff timing and size and rolls them up per campaign.
///
/// Recording never fails from the caller's point of view: problems are
/// logged and the pipeline carries on.
pub struct HandoffMonitor {
    config: MonitorConfig,
    records: Mutex<HashMap<CampaignId, Vec<HandoffMetrics>>>,
    store: Option<Arc<MetricsStore>>,
    event_bus: Option<Arc<EventBus>>,
}

impl HandoffMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            config: config.clone(),
            records: Mutex::new(HashMap::new()),
            store: None,
            event_bus: None,
        }
    }

    /// Monitor with the configured SQLite store attached, if any. A store
    /// that cannot be opened is logged and skipped.
    pub fn from_config(config: &AppConfig) -> Self {
        let monitor = Self::new(&config.monitor);
        match config.metrics_db_path() {
            Some(path) => match MetricsStore::open(&path) {
                Ok(store) => monitor.with_store(Arc::new(store)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Metrics store unavailable, keeping metrics in memory");
                    monitor
                }
            },
            None => monitor,
        }
    }

    pub fn with_store(mut self, store: Arc<MetricsStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn store(&self) -> Option<&Arc<MetricsStore>> {
        self.store.as_ref()
    }

    /// Record one handoff attempt. Fire-and-forget.
    pub fn record_handoff(&self, metrics: HandoffMetrics) {
        if !self.config.enabled {
            return;
        }

        for alert in self.alerts_for(&metrics) {
            warn!(
                campaign_id = %metrics.campaign_id,
                transition = %alert.transition,
                kind = ?alert.kind,
                "{}",
                alert.message
            );
        }

        match self.records.lock() {
            Ok(mut records) => {
                let held = records.entry(metrics.campaign_id.clone()).or_default();
                held.push(metrics.clone());
                let cap = self.config.max_records_per_campaign.max(1);
                if held.len() > cap {
                    let excess = held.len() - cap;
                    held.drain(..excess);
                }
            }
            Err(e) => warn!(error = %e, "Handoff monitor state poisoned, record dropped"),
        }

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let row = metrics.clone();
            let persist = move || {
                if let Err(e) = store.record(&row) {
                    warn!(handoff_id = %row.handoff_id, error = %e, "Failed to persist handoff metrics");
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(persist);
                }
                Err(_) => persist(),
            }
        }

        debug!(
            campaign_id = %metrics.campaign_id,
            transition = %metrics.transition(),
            success = metrics.success,
            duration_ms = metrics.duration_ms,
            "Handoff recorded"
        );
        if let Some(bus) = &self.event_bus {
            bus.publish(PipelineEvent::HandoffRecorded { metrics });
        }
    }

    /// Records held in memory for a campaign.
    pub fn records(&self, campaign_id: &CampaignId) -> Vec<HandoffMetrics> {
        self.records
            .lock()
            .map(|r| r.get(campaign_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Drop a campaign's in-memory records. Persisted rows are kept.
    pub fn forget(&self, campaign_id: &CampaignId) {
        if let Ok(mut records) = self.records.lock() {
            if records.remove(campaign_id).is_some() {
                debug!(campaign_id = %campaign_id, "Released in-memory handoff records");
            }
        }
    }

    /// Campaign roll-up. Falls back to the persisted store when nothing is
    /// held in memory (e.g. from a fresh process).
    pub fn summarize(&self, campaign_id: &CampaignId) -> HandoffSummary {
        let mut records = self.records(campaign_id);
        if records.is_empty() {
            if let Some(store) = &self.store {
                match store.for_campaign(campaign_id) {
                    Ok(rows) => records = rows,
                    Err(e) => warn!(campaign_id = %campaign_id, error = %e, "Failed to load persisted metrics"),
                }
            }
        }
        summarize_records(campaign_id, &records, &self.config)
    }

    /// Alerts raised by a single record.
    pub fn alerts_for(&self, metrics: &HandoffMetrics) -> Vec<PerformanceAlert> {
        alerts_for(metrics, &self.config)
    }
}

fn alerts_for(m: &HandoffMetrics, config: &MonitorConfig) -> Vec<PerformanceAlert> {
    let mut alerts = Vec::new();
    let transition = m.transition();
    if !m.success {
        alerts.push(PerformanceAlert {
            kind: AlertKind::HandoffFailed,
            handoff_id: m.handoff_id.clone(),
            transition: transition.clone(),
            message: format!(
                "{} failed: {}",
                transition,
                m.error.as_deref().unwrap_or("unknown error")
            ),
        });
    }
    if m.total_ms() > config.slow_handoff_ms {
        alerts.push(PerformanceAlert {
            kind: AlertKind::SlowHandoff,
            handoff_id: m.handoff_id.clone(),
            transition: transition.clone(),
            message: format!(
                "{} took {}ms (limit {}ms)",
                transition,
                m.total_ms(),
                config.slow_handoff_ms
            ),
        });
    }
    if m.data_size_bytes > config.large_payload_bytes {
        alerts.push(PerformanceAlert {
            kind: AlertKind::LargePayload,
            handoff_id: m.handoff_id.clone(),
            transition: transition.clone(),
            message: format!(
                "{} envelope is {} bytes (limit {})",
                transition, m.data_size_bytes, config.large_payload_bytes
            ),
        });
    }
    alerts
}

/// Roll up `records` for one campaign. Bytes are counted for successful
/// handoffs only; the realized chain lists each successful source stage once.
pub fn summarize_records(
    campaign_id: &CampaignId,
    records: &[HandoffMetrics],
    config: &MonitorConfig,
) -> HandoffSummary {
    let mut summary = HandoffSummary::empty(campaign_id.clone());
    if records.is_empty() {
        return summary;
    }

    let total = records.len();
    let successful = records.iter().filter(|m| m.success).count();
    summary.total_handoffs = total;
    summary.successful_handoffs = successful;
    summary.failed_handoffs = total - successful;
    summary.success_rate = successful as f64 * 100.0 / total as f64;
    summary.average_duration_ms =
        records.iter().map(|m| m.duration_ms as f64).sum::<f64>() / total as f64;
    summary.max_duration_ms = records.iter().map(|m| m.duration_ms).max().unwrap_or(0);
    summary.average_validation_ms =
        records.iter().map(|m| m.validation_duration_ms as f64).sum::<f64>() / total as f64;
    summary.total_bytes_transferred = records
        .iter()
        .filter(|m| m.success)
        .map(|m| m.data_size_bytes)
        .sum();

    for m in records.iter().filter(|m| m.success) {
        if !summary.handoff_chain.contains(&m.source_stage) {
            summary.handoff_chain.push(m.source_stage);
        }
    }

    let mut by_transition: BTreeMap<(Stage, String), Vec<&HandoffMetrics>> = BTreeMap::new();
    for m in records {
        by_transition
            .entry((m.source_stage, m.transition()))
            .or_default()
            .push(m);
    }
    summary.transitions = by_transition
        .into_iter()
        .map(|((_, transition), group)| {
            let successes = group.iter().filter(|m| m.success).count();
            TransitionStats {
                transition,
                attempts: group.len(),
                successes,
                failures: group.len() - successes,
                average_duration_ms: group.iter().map(|m| m.duration_ms as f64).sum::<f64>()
                    / group.len() as f64,
                total_bytes: group.iter().map(|m| m.data_size_bytes).sum(),
                last_error: group.iter().rev().find_map(|m| m.error.clone()),
            }
        })
        .collect();

    summary.alerts = records.iter().flat_map(|m| alerts_for(m, config)).collect();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metrics(from: Stage, duration_ms: u64, bytes: u64, success: bool) -> HandoffMetrics {
        let now = Utc::now();
        HandoffMetrics {
            handoff_id: uuid::Uuid::new_v4().to_string(),
            campaign_id: CampaignId("c1".into()),
            source_stage: from,
            target_stage: from.next(),
            start_time: now,
            end_time: now,
            duration_ms,
            data_size_bytes: bytes,
            validation_duration_ms: 5,
            success,
            error: (!success).then(|| "missing dependency: pricing-analysis.json".to_string()),
        }
    }

    #[test]
    fn test_summary_of_nothing() {
        let monitor = HandoffMonitor::new(&MonitorConfig::default());
        let summary = monitor.summarize(&CampaignId("none".into()));
        assert_eq!(summary.total_handoffs, 0);
        assert_eq!(summary.success_rate, 100.0);
    }

    #[test]
    fn test_summary_aggregates() {
        let monitor = HandoffMonitor::new(&MonitorConfig::default());
        monitor.record_handoff(metrics(Stage::DataCollection, 10, 100, true));
        monitor.record_handoff(metrics(Stage::Content, 30, 300, false));
        monitor.record_handoff(metrics(Stage::Content, 20, 200, true));

        let summary = monitor.summarize(&CampaignId("c1".into()));
        assert_eq!(summary.total_handoffs, 3);
        assert_eq!(summary.successful_handoffs, 2);
        assert_eq!(summary.failed_handoffs, 1);
        assert!((summary.average_duration_ms - 20.0).abs() < 1e-9);
        assert_eq!(summary.max_duration_ms, 30);
        assert_eq!(summary.total_bytes_transferred, 300);
        assert_eq!(summary.handoff_chain, vec![Stage::DataCollection, Stage::Content]);

        assert_eq!(summary.transitions.len(), 2);
        let content = &summary.transitions[1];
        assert_eq!(content.transition, "content-to-design");
        assert_eq!(content.attempts, 2);
        assert_eq!(content.failures, 1);
        assert!(content.last_error.is_some());

        assert_eq!(summary.alerts.len(), 1);
        assert_eq!(summary.alerts[0].kind, AlertKind::HandoffFailed);
    }

    #[test]
    fn test_slow_and_large_alerts() {
        let config = MonitorConfig {
            slow_handoff_ms: 50,
            large_payload_bytes: 1000,
            ..MonitorConfig::default()
        };
        let monitor = HandoffMonitor::new(&config);
        let alerts = monitor.alerts_for(&metrics(Stage::Design, 60, 5000, true));
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::SlowHandoff, AlertKind::LargePayload]);
    }

    #[test]
    fn test_records_are_capped_per_campaign() {
        let config = MonitorConfig {
            max_records_per_campaign: 3,
            ..MonitorConfig::default()
        };
        let monitor = HandoffMonitor::new(&config);
        for duration in 1..=5 {
            monitor.record_handoff(metrics(Stage::DataCollection, duration, 10, true));
        }

        let held = monitor.records(&CampaignId("c1".into()));
        let durations: Vec<u64> = held.iter().map(|m| m.duration_ms).collect();
        assert_eq!(durations, vec![3, 4, 5]);
    }

    #[test]
    fn test_forget_releases_campaign_records() {
        let monitor = HandoffMonitor::new(&MonitorConfig::default());
        monitor.record_handoff(metrics(Stage::DataCollection, 1, 1, true));
        monitor.forget(&CampaignId("c1".into()));
        assert!(monitor.records(&CampaignId("c1".into())).is_empty());
        assert_eq!(monitor.summarize(&CampaignId("c1".into())).total_handoffs, 0);
    }

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let config = MonitorConfig {
            enabled: false,
            ..MonitorConfig::default()
        };
        let monitor = HandoffMonitor::new(&config);
        monitor.record_handoff(metrics(Stage::DataCollection, 1, 1, true));
        assert!(monitor.records(&CampaignId("c1".into())).is_empty());
    }

    #[test]
    fn test_persisted_records_back_summary() {
        let store = Arc::new(MetricsStore::in_memory().unwrap());
        store.record(&metrics(Stage::DataCollection, 10, 100, true)).unwrap();

        let monitor = HandoffMonitor::new(&MonitorConfig::default()).with_store(store);
        let summary = monitor.summarize(&CampaignId("c1".into()));
        assert_eq!(summary.total_handoffs, 1);
        assert_eq!(summary.handoff_chain, vec![Stage::DataCollection]);
    }

    #[tokio::test]
    async fn test_record_publishes_event() {
        let bus = Arc::new(EventBus::new(8));
        let mut rx = bus.subscribe();
        let monitor = HandoffMonitor::new(&MonitorConfig::default()).with_event_bus(bus);
        monitor.record_handoff(metrics(Stage::Quality, 1, 1, true));
        match rx.recv().await.unwrap() {
            PipelineEvent::HandoffRecorded { metrics } => {
                assert_eq!(metrics.source_stage, Stage::Quality)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
