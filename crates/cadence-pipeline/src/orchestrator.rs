use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use cadence_core::config::AppConfig;
use cadence_core::envelope::{HandoffEnvelope, SpecialistOutputs, StageResult};
use cadence_core::error::{CadenceError, Result};
use cadence_core::event::{EventBus, PipelineEvent};
use cadence_core::metadata::{CampaignMetadata, CampaignStatus};
use cadence_core::metrics::{HandoffMetrics, HandoffSummary};
use cadence_core::report::{ContinuityReport, ValidationResult};
use cadence_core::traits::StageWorker;
use cadence_core::types::{transition_name, CampaignContext, Phase, Stage};

use crate::builder::HandoffBuilder;
use crate::context::{CampaignRequest, ContextManager};
use crate::continuity::ContinuityAnalyzer;
use crate::handoff_log::{HandoffLogger, HANDOFF_LOG_FILE};
use crate::monitor::HandoffMonitor;
use crate::path::{self, CampaignPathResolver, LOGS_DIR};
use crate::store::CampaignStore;
use crate::validator::HandoffValidator;

/// What an operator needs to diagnose a halted campaign without re-running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReport {
    pub campaign_id: String,
    pub workflow_phase: Phase,
    pub transition: String,
    pub findings: Vec<String>,
    /// Full validator output, when the halt came from validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl HaltReport {
    /// Rebuild the report recorded in a failed campaign's metadata.
    pub fn from_metadata(metadata: &CampaignMetadata) -> Option<Self> {
        if metadata.status != CampaignStatus::Failed {
            return None;
        }
        Some(Self {
            campaign_id: metadata.id.to_string(),
            workflow_phase: metadata.workflow_phase,
            transition: metadata.failed_transition.clone().unwrap_or_default(),
            findings: metadata.last_errors.clone(),
            validation: None,
        })
    }
}

/// One accepted handoff.
#[derive(Debug, Clone)]
pub struct Advance {
    pub context: CampaignContext,
    pub envelope: HandoffEnvelope,
    pub validation: ValidationResult,
}

/// Result of a full `run`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub context: CampaignContext,
    pub status: CampaignStatus,
    pub envelopes: Vec<HandoffEnvelope>,
    pub continuity: Option<ContinuityReport>,
    pub summary: HandoffSummary,
}

/// Drives one campaign through its stages: context, build, validate, record.
///
/// Stages run strictly in order. A rejected handoff halts the campaign and
/// leaves the diagnostic in `campaign-metadata.json`.
pub struct CampaignPipeline {
    config: AppConfig,
    contexts: ContextManager,
    resolver: CampaignPathResolver,
    builder: HandoffBuilder,
    validator: HandoffValidator,
    analyzer: ContinuityAnalyzer,
    monitor: Arc<HandoffMonitor>,
    event_bus: Arc<EventBus>,
}

impl CampaignPipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_event_bus(config, Arc::new(EventBus::new(256)))
    }

    pub fn with_event_bus(config: AppConfig, event_bus: Arc<EventBus>) -> Result<Self> {
        config.validate()?;
        let resolver = CampaignPathResolver::new(config.campaigns_root());
        let builder = HandoffBuilder::new(resolver.clone(), &config.pipeline)
            .with_event_bus(event_bus.clone());
        let validator = HandoffValidator::from_config(&config).with_event_bus(event_bus.clone());
        let analyzer = ContinuityAnalyzer::from_config(&config)?.with_event_bus(event_bus.clone());
        let monitor = Arc::new(HandoffMonitor::from_config(&config).with_event_bus(event_bus.clone()));

        Ok(Self {
            config,
            contexts: ContextManager::new(),
            resolver,
            builder,
            validator,
            analyzer,
            monitor,
            event_bus,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn monitor(&self) -> &Arc<HandoffMonitor> {
        &self.monitor
    }

    pub fn validator(&self) -> &HandoffValidator {
        &self.validator
    }

    pub fn analyzer(&self) -> &ContinuityAnalyzer {
        &self.analyzer
    }

    pub fn resolver(&self) -> &CampaignPathResolver {
        &self.resolver
    }

    pub fn store_for(&self, context: &CampaignContext) -> Result<CampaignStore> {
        self.builder.store_for(context)
    }

    /// Create a fresh context, prepare the campaign directory and write the
    /// initial metadata.
    pub async fn start(&self, request: &CampaignRequest) -> Result<CampaignContext> {
        let context = self.contexts.create_context(request)?;
        let check = self.contexts.validate_context(&context);
        if let Some(err) = check.into_error("context") {
            return Err(err);
        }

        let store = self.store_for(&context)?;
        self.ensure_layout(&store).await?;
        store
            .write_metadata(&CampaignMetadata::for_context(&context))
            .await?;

        info!(
            campaign_id = %context.campaign.id,
            campaign_path = %store.canonical(),
            workflow = ?context.workflow_type,
            total_phases = context.total_phases,
            "Campaign started"
        );
        self.event_bus.publish(PipelineEvent::CampaignStarted {
            campaign_id: context.campaign.id.clone(),
            campaign_path: store.canonical().to_string(),
        });
        Ok(context)
    }

    /// Continue a campaign from its latest committed envelope. Falls back to
    /// `start` when nothing has been committed yet.
    ///
    /// The latest envelope goes through the validator again before anything
    /// runs on it. A refused envelope is moved out of the chain and the
    /// campaign halts at its transition.
    pub async fn resume(&self, request: &CampaignRequest) -> Result<CampaignContext> {
        let initial = self.contexts.create_context(request)?;
        let store = self.store_for(&initial)?;
        let latest = match store.latest_envelope().await? {
            Some(envelope) => envelope,
            None => return self.start(request).await,
        };

        let validation = self.validator.validate(&latest, store.canonical()).await;
        let transition = latest.transition_name();
        if let Some(err) = validation.clone().into_error(&transition) {
            let from = latest.source_stage();
            match store.reject(from, latest.target_stage()).await {
                Ok(Some(path)) => warn!(path = %path.display(), "Refused envelope moved out of the chain"),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Failed to move refused envelope aside"),
            }
            let mut at = initial;
            at.current_phase = Phase::from(from);
            self.halt(&store, &at, &transition, validation.all_findings(), Some(validation))
                .await;
            return Err(err);
        }

        let context = self.contexts.resume_context(request, &latest)?;
        self.ensure_layout(&store).await?;

        let mut metadata = match store.try_read_metadata().await? {
            Some(metadata) => metadata,
            None => CampaignMetadata::for_context(&context),
        };
        for stage in &context.handoff_chain {
            metadata.specialists_completed.insert(*stage, true);
        }
        metadata.workflow_phase = context.current_phase;
        metadata.status = if context.current_stage().is_none() {
            CampaignStatus::Completed
        } else {
            CampaignStatus::InProgress
        };
        metadata.failed_transition = None;
        metadata.last_errors.clear();
        metadata.updated_at = Some(Utc::now());
        store.write_metadata(&metadata).await?;

        info!(
            campaign_id = %context.campaign.id,
            phase = %context.current_phase,
            completed = context.handoff_chain.len(),
            "Campaign resumed"
        );
        self.event_bus.publish(PipelineEvent::CampaignStarted {
            campaign_id: context.campaign.id.clone(),
            campaign_path: store.canonical().to_string(),
        });
        Ok(context)
    }

    async fn ensure_layout(&self, store: &CampaignStore) -> Result<()> {
        if self.config.pipeline.create_layout {
            path::prepare_layout(store.dir(), store.io_timeout()).await
        } else {
            path::verify_layout(store.dir()).await
        }
    }

    /// Hand off the current stage's result to the next stage.
    ///
    /// On success the returned context is positioned on the next stage and
    /// the metadata is updated. On a rejected handoff the envelope is moved
    /// out of the chain, the campaign is marked failed and the layer error
    /// (carrying the full `ValidationResult`) is returned.
    pub async fn advance(
        &self,
        context: &CampaignContext,
        result: &StageResult,
        execution_duration_ms: Option<u64>,
    ) -> Result<Advance> {
        let stage = context.current_stage().ok_or_else(|| {
            CadenceError::Configuration(format!(
                "Campaign '{}' has no stage left to hand off (phase: {})",
                context.campaign.id, context.current_phase
            ))
        })?;
        let target = stage.next();
        let transition = transition_name(stage, target);
        let store = self.store_for(context)?;

        let precheck = self.contexts.validate_context(context);
        if let Some(err) = precheck.clone().into_error(&transition) {
            self.halt(&store, context, &transition, precheck.all_findings(), Some(precheck))
                .await;
            return Err(err);
        }

        let next = match self.contexts.enhance_for_handoff(context, result) {
            Ok(next) => next,
            Err(e) => {
                self.halt(&store, context, &transition, vec![e.to_string()], None)
                    .await;
                return Err(e);
            }
        };
        ContextManager::ensure_monotonic(context, &next)?;

        let started_at = Utc::now();
        let staged = match self
            .builder
            .stage(stage, target, &next, &result.output, execution_duration_ms)
            .await
        {
            Ok(staged) => staged,
            // Another writer owns this transition; its outcome decides the campaign.
            Err(e @ CadenceError::HandoffInProgress { .. }) => return Err(e),
            Err(e) => {
                self.record(stage, target, context, None, started_at, 0, 0, 0, Some(e.to_string()));
                self.halt(&store, context, &transition, vec![e.to_string()], None)
                    .await;
                return Err(e);
            }
        };

        let validation_started = Instant::now();
        let validation = self
            .validator
            .validate(&staged.envelope, store.canonical())
            .await;
        let validation_ms = validation_started.elapsed().as_millis() as u64;

        if let Some(err) = validation.clone().into_error(&transition) {
            let findings = validation.all_findings();
            self.record(
                stage,
                target,
                context,
                Some(&staged.envelope.handoff_info.handoff_id),
                staged.started_at,
                staged.elapsed_ms(),
                staged.bytes,
                validation_ms,
                Some(findings.join("; ")),
            );
            match staged.reject().await {
                Ok(Some(path)) => warn!(path = %path.display(), "Rejected envelope kept out of the chain"),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Failed to archive rejected envelope"),
            }
            self.halt(&store, context, &transition, findings, Some(validation))
                .await;
            return Err(err);
        }

        let built = match staged.promote().await {
            Ok(built) => built,
            Err(e) => {
                self.record(stage, target, context, None, started_at, 0, 0, validation_ms, Some(e.to_string()));
                self.halt(&store, context, &transition, vec![e.to_string()], None)
                    .await;
                return Err(e);
            }
        };

        let mut metadata = match store.try_read_metadata().await? {
            Some(metadata) => metadata,
            None => CampaignMetadata::for_context(context),
        };
        metadata.mark_stage_completed(stage, next.current_phase);
        store.write_metadata(&metadata).await?;

        self.record(
            stage,
            target,
            context,
            Some(&built.envelope.handoff_info.handoff_id),
            built.started_at,
            built.duration_ms,
            built.bytes,
            validation_ms,
            None,
        );

        info!(
            campaign_id = %next.campaign.id,
            transition = %transition,
            phase = %next.current_phase,
            completion = next.completion_percentage(),
            "Handoff accepted"
        );
        Ok(Advance {
            context: next,
            envelope: built.envelope,
            validation,
        })
    }

    /// Run every planned stage in order with the given workers.
    ///
    /// Planned stages run from the context's current stage up to
    /// `total_phases`. Cancellation abandons the in-flight stage; the
    /// atomic commit guarantees nothing partial is left behind.
    pub async fn run(
        &self,
        request: &CampaignRequest,
        workers: &[Arc<dyn StageWorker>],
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let logger = self.spawn_logger(request)?;
        match self.start(request).await {
            Ok(context) => self.drive(context, workers, cancel, logger).await,
            Err(e) => {
                stop_logger(logger).await;
                Err(e)
            }
        }
    }

    /// Like [`run`](Self::run), continuing from the latest committed envelope.
    pub async fn run_resumed(
        &self,
        request: &CampaignRequest,
        workers: &[Arc<dyn StageWorker>],
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let logger = self.spawn_logger(request)?;
        match self.resume(request).await {
            Ok(context) => self.drive(context, workers, cancel, logger).await,
            Err(e) => {
                stop_logger(logger).await;
                Err(e)
            }
        }
    }

    /// Start the JSONL handoff logger for the request's campaign, before any
    /// of its events are published.
    fn spawn_logger(&self, request: &CampaignRequest) -> Result<Option<LoggerHandle>> {
        let level = self.config.monitor.log_level;
        if level == 0 {
            return Ok(None);
        }
        let initial = self.contexts.create_context(request)?;
        let store = self.store_for(&initial)?;
        let cancel = CancellationToken::new();
        let handle = HandoffLogger::new(store.dir().join(LOGS_DIR).join(HANDOFF_LOG_FILE), level)
            .spawn(&self.event_bus, initial.campaign.id, cancel.clone());
        Ok(Some((handle, cancel)))
    }

    async fn drive(
        &self,
        mut context: CampaignContext,
        workers: &[Arc<dyn StageWorker>],
        cancel: CancellationToken,
        logger: Option<LoggerHandle>,
    ) -> Result<RunReport> {
        let store = match self.store_for(&context) {
            Ok(store) => store,
            Err(e) => {
                stop_logger(logger).await;
                return Err(e);
            }
        };
        let campaign_id = context.campaign.id.clone();

        let planned: Vec<Stage> = Stage::ALL
            .iter()
            .copied()
            .skip(context.handoff_chain.len())
            .take(context.total_phases.saturating_sub(context.handoff_chain.len()))
            .collect();

        let mut envelopes = Vec::new();
        let outcome = self
            .run_stages(&mut context, &planned, workers, &cancel, &store, &mut envelopes)
            .await;

        let continuity = match &outcome {
            Ok(()) => {
                let report = self.finish_continuity(&store).await;
                if context.current_stage().is_none() {
                    self.event_bus.publish(PipelineEvent::CampaignCompleted {
                        campaign_id: campaign_id.clone(),
                    });
                    info!(campaign_id = %campaign_id, "Campaign completed");
                } else {
                    self.event_bus.publish(PipelineEvent::CampaignPaused {
                        campaign_id: campaign_id.clone(),
                        workflow_phase: context.current_phase,
                    });
                    info!(campaign_id = %campaign_id, phase = %context.current_phase, "Planned stages finished");
                }
                report
            }
            Err(_) => None,
        };

        stop_logger(logger).await;

        outcome?;
        let status = store
            .try_read_metadata()
            .await?
            .map(|m| m.status)
            .unwrap_or(CampaignStatus::InProgress);

        let summary = self.monitor.summarize(&campaign_id);
        if status == CampaignStatus::Completed {
            self.monitor.forget(&campaign_id);
        }

        Ok(RunReport {
            summary,
            context,
            status,
            envelopes,
            continuity,
        })
    }

    async fn run_stages(
        &self,
        context: &mut CampaignContext,
        planned: &[Stage],
        workers: &[Arc<dyn StageWorker>],
        cancel: &CancellationToken,
        store: &CampaignStore,
        envelopes: &mut Vec<HandoffEnvelope>,
    ) -> Result<()> {
        let mut prior = self.prior_outputs(store, planned.first().copied()).await?;

        for &stage in planned {
            if cancel.is_cancelled() {
                return Err(self.cancelled(store, context).await);
            }
            let transition = transition_name(stage, stage.next());

            let worker = match workers.iter().find(|w| w.stage() == stage) {
                Some(worker) => worker.clone(),
                None => {
                    let err = CadenceError::Configuration(format!("No worker registered for stage '{}'", stage));
                    self.halt(store, context, &transition, vec![err.to_string()], None)
                        .await;
                    return Err(err);
                }
            };

            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.cancelled(store, context).await);
                }
                result = run_worker(worker.as_ref(), context, &prior) => result,
            };
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    error!(stage = %stage, error = %e, "Stage worker failed");
                    self.halt(store, context, &transition, vec![e.to_string()], None)
                        .await;
                    return Err(e);
                }
            };
            let execution_ms = started.elapsed().as_millis() as u64;

            let advance = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.cancelled(store, context).await);
                }
                advance = self.advance(context, &result, Some(execution_ms)) => advance?,
            };

            prior = advance.envelope.specialist_outputs.clone();
            *context = advance.context;
            envelopes.push(advance.envelope);
        }
        Ok(())
    }

    async fn prior_outputs(&self, store: &CampaignStore, stage: Option<Stage>) -> Result<SpecialistOutputs> {
        match stage {
            Some(stage) if !stage.is_first() => Ok(store.envelope_into(stage).await?.specialist_outputs),
            _ => Ok(SpecialistOutputs::new()),
        }
    }

    async fn finish_continuity(&self, store: &CampaignStore) -> Option<ContinuityReport> {
        match self.analyzer.analyze_store(store).await {
            Ok(report) => {
                self.analyzer.surface(&report);
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "Continuity analysis failed");
                None
            }
        }
    }

    /// The halt report for a campaign, read from its metadata.
    pub async fn halt_report(&self, context: &CampaignContext) -> Result<Option<HaltReport>> {
        let store = self.store_for(context)?;
        Ok(store
            .try_read_metadata()
            .await?
            .and_then(|m| HaltReport::from_metadata(&m)))
    }

    /// Roll-up of every handoff recorded for the campaign.
    pub fn summary(&self, context: &CampaignContext) -> HandoffSummary {
        self.monitor.summarize(&context.campaign.id)
    }

    async fn halt(
        &self,
        store: &CampaignStore,
        context: &CampaignContext,
        transition: &str,
        findings: Vec<String>,
        validation: Option<ValidationResult>,
    ) -> HaltReport {
        let mut metadata = match store.try_read_metadata().await {
            Ok(Some(metadata)) => metadata,
            _ => CampaignMetadata::for_context(context),
        };
        metadata.workflow_phase = context.current_phase;
        metadata.mark_failed(transition, findings.clone());
        if let Err(e) = store.write_metadata(&metadata).await {
            error!(error = %e, "Failed to record halt in campaign metadata");
        }

        error!(
            campaign_id = %context.campaign.id,
            transition = %transition,
            phase = %context.current_phase,
            findings = findings.len(),
            "Campaign halted"
        );
        self.event_bus.publish(PipelineEvent::CampaignHalted {
            campaign_id: context.campaign.id.clone(),
            transition: transition.to_string(),
            workflow_phase: context.current_phase,
            findings: findings.clone(),
        });

        HaltReport {
            campaign_id: context.campaign.id.to_string(),
            workflow_phase: context.current_phase,
            transition: transition.to_string(),
            findings,
            validation,
        }
    }

    async fn cancelled(&self, store: &CampaignStore, context: &CampaignContext) -> CadenceError {
        match store.try_read_metadata().await {
            Ok(Some(mut metadata)) => {
                metadata.mark_cancelled();
                if let Err(e) = store.write_metadata(&metadata).await {
                    error!(error = %e, "Failed to record cancellation");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to read metadata during cancellation"),
        }

        warn!(
            campaign_id = %context.campaign.id,
            phase = %context.current_phase,
            "Campaign cancelled"
        );
        self.event_bus.publish(PipelineEvent::CampaignCancelled {
            campaign_id: context.campaign.id.clone(),
            workflow_phase: context.current_phase,
        });
        CadenceError::Cancelled(format!(
            "campaign '{}' cancelled during {}",
            context.campaign.id, context.current_phase
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        stage: Stage,
        target: Option<Stage>,
        context: &CampaignContext,
        handoff_id: Option<&String>,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        bytes: u64,
        validation_ms: u64,
        error: Option<String>,
    ) {
        self.monitor.record_handoff(HandoffMetrics {
            handoff_id: handoff_id
                .cloned()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            campaign_id: context.campaign.id.clone(),
            source_stage: stage,
            target_stage: target,
            start_time: started_at,
            end_time: Utc::now(),
            duration_ms,
            data_size_bytes: bytes,
            validation_duration_ms: validation_ms,
            success: error.is_none(),
            error,
        });
    }
}

type LoggerHandle = (JoinHandle<()>, CancellationToken);

/// Stop the logger once everything queued for it has been written.
async fn stop_logger(logger: Option<LoggerHandle>) {
    if let Some((handle, cancel)) = logger {
        // The logger drains queued events before it honours cancellation.
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Handoff logger task failed");
        }
    }
}

async fn run_worker(
    worker: &dyn StageWorker,
    context: &CampaignContext,
    prior: &SpecialistOutputs,
) -> Result<StageResult> {
    let limit = worker.timeout_secs();
    if limit == 0 {
        return worker.run(context, prior).await;
    }
    match tokio::time::timeout(Duration::from_secs(limit), worker.run(context, prior)).await {
        Ok(result) => result,
        Err(_) => Err(CadenceError::Timeout {
            operation: format!("stage '{}'", worker.stage()),
            timeout_secs: limit,
        }),
    }
}
