use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use cadence_core::config::PipelineConfig;
use cadence_core::envelope::{
    CampaignSnapshot, HandoffEnvelope, HandoffInfo, SpecialistOutputs, StageOutput,
    WorkflowStatus,
};
use cadence_core::error::{CadenceError, Result};
use cadence_core::event::{EventBus, PipelineEvent};
use cadence_core::types::{completion_percentage, transition_name, CampaignContext, Stage};

use crate::path::CampaignPathResolver;
use crate::store::{CampaignStore, HandoffLock};

/// A committed envelope plus what it took to commit it.
#[derive(Debug, Clone)]
pub struct BuiltHandoff {
    pub envelope: HandoffEnvelope,
    pub path: PathBuf,
    pub bytes: u64,
    pub superseded: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A candidate envelope in its staging file. It keeps the campaign's write
/// lock until it is promoted into the chain or rejected.
pub struct StagedHandoff {
    pub envelope: HandoffEnvelope,
    pub staged_path: PathBuf,
    pub bytes: u64,
    pub started_at: DateTime<Utc>,
    started: Instant,
    transition: String,
    store: CampaignStore,
    event_bus: Option<Arc<EventBus>>,
    _lock: HandoffLock,
}

impl StagedHandoff {
    pub fn store(&self) -> &CampaignStore {
        &self.store
    }

    /// Milliseconds since staging began.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Commit the candidate under its canonical name, superseding whatever
    /// was committed for the transition before.
    pub async fn promote(self) -> Result<BuiltHandoff> {
        let from = self.envelope.source_stage();
        let to = self.envelope.target_stage();
        let campaign_id = self.envelope.handoff_info.campaign_id.clone();

        let superseded = self.store.supersede(from, to).await?;
        if let Some(archived) = &superseded {
            publish(
                self.event_bus.as_ref(),
                PipelineEvent::HandoffSuperseded {
                    campaign_id: campaign_id.clone(),
                    transition: self.transition.clone(),
                    archived_as: archived.display().to_string(),
                },
            );
        }

        let path = match self.store.promote_staged(from, to).await {
            Ok(path) => path,
            Err(e) => {
                if let Some(archived) = &superseded {
                    let current = self.store.envelope_path(from, to);
                    if let Err(restore) = tokio::fs::rename(archived, &current).await {
                        error!(
                            archived = %archived.display(),
                            error = %restore,
                            "Failed to restore superseded envelope"
                        );
                    }
                }
                return Err(e);
            }
        };
        let duration_ms = self.started.elapsed().as_millis() as u64;

        info!(
            campaign_id = %campaign_id,
            transition = %self.transition,
            bytes = self.bytes,
            duration_ms,
            "Handoff committed"
        );
        publish(
            self.event_bus.as_ref(),
            PipelineEvent::HandoffCommitted {
                campaign_id,
                transition: self.transition.clone(),
                handoff_id: self.envelope.handoff_info.handoff_id.clone(),
                path: path.display().to_string(),
                bytes: self.bytes,
            },
        );

        Ok(BuiltHandoff {
            envelope: self.envelope,
            path,
            bytes: self.bytes,
            superseded,
            started_at: self.started_at,
            duration_ms,
        })
    }

    /// Archive the candidate as rejected. The transition's committed
    /// envelope, if any, stays in the chain.
    pub async fn reject(self) -> Result<Option<PathBuf>> {
        self.store
            .reject_staged(self.envelope.source_stage(), self.envelope.target_stage())
            .await
    }
}

/// Assembles handoff envelopes and commits them atomically, one writer per
/// campaign at a time.
pub struct HandoffBuilder {
    resolver: CampaignPathResolver,
    io_timeout: Duration,
    lock_stale_after: Duration,
    format_version: String,
    event_bus: Option<Arc<EventBus>>,
}

impl HandoffBuilder {
    pub fn new(resolver: CampaignPathResolver, config: &PipelineConfig) -> Self {
        Self {
            resolver,
            io_timeout: config.io_timeout(),
            lock_stale_after: config.lock_stale_after(),
            format_version: config.format_version.clone(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn resolver(&self) -> &CampaignPathResolver {
        &self.resolver
    }

    /// Store for the campaign `context` points at.
    pub fn store_for(&self, context: &CampaignContext) -> Result<CampaignStore> {
        let canonical = self.resolver.resolve_context(context)?;
        Ok(CampaignStore::open(&self.resolver, &canonical, self.io_timeout)
            .with_lock_stale_after(self.lock_stale_after))
    }

    /// Build and commit the envelope for `from -> to`.
    ///
    /// `context` must already carry `from` at the end of its handoff chain
    /// (see `ContextManager::enhance_for_handoff`).
    pub async fn build(
        &self,
        from: Stage,
        to: Option<Stage>,
        context: &CampaignContext,
        output: &StageOutput,
    ) -> Result<HandoffEnvelope> {
        self.commit(from, to, context, output, None)
            .await
            .map(|built| built.envelope)
    }

    /// Like [`build`](Self::build), recording the stage's execution time and
    /// returning commit details.
    pub async fn commit(
        &self,
        from: Stage,
        to: Option<Stage>,
        context: &CampaignContext,
        output: &StageOutput,
        execution_duration_ms: Option<u64>,
    ) -> Result<BuiltHandoff> {
        self.stage(from, to, context, output, execution_duration_ms)
            .await?
            .promote()
            .await
    }

    /// Assemble the envelope for `from -> to` and write it to the staging
    /// file under the campaign's write lock. Nothing in the chain changes
    /// until the result is promoted.
    pub async fn stage(
        &self,
        from: Stage,
        to: Option<Stage>,
        context: &CampaignContext,
        output: &StageOutput,
        execution_duration_ms: Option<u64>,
    ) -> Result<StagedHandoff> {
        let started = Instant::now();
        let started_at = Utc::now();
        let transition = transition_name(from, to);

        if to != from.next() {
            return Err(CadenceError::Configuration(format!(
                "{} is not an adjacent transition (expected {})",
                transition,
                transition_name(from, from.next())
            )));
        }
        if context.handoff_chain.last() != Some(&from) {
            return Err(CadenceError::ChainMismatch {
                expected: chain_names(from.predecessors().iter().chain([&from])),
                found: chain_names(context.handoff_chain.iter()),
            });
        }

        let store = self.store_for(context)?;
        let campaign_id = context.campaign.id.clone();
        let lock = store.acquire_lock(campaign_id.as_str(), &transition).await?;

        let mut outputs = if from.is_first() {
            SpecialistOutputs::new()
        } else {
            let previous = store.envelope_into(from).await?;
            if previous.handoff_info.campaign_id != campaign_id {
                return Err(CadenceError::Persistence(format!(
                    "envelope into '{}' belongs to campaign '{}'",
                    from, previous.handoff_info.campaign_id
                )));
            }
            previous.specialist_outputs
        };
        outputs.insert(from, output.clone())?;

        let stages = outputs.stages();
        if stages != context.handoff_chain {
            return Err(CadenceError::ChainMismatch {
                expected: chain_names(context.handoff_chain.iter()),
                found: chain_names(stages.iter()),
            });
        }

        let envelope = HandoffEnvelope {
            handoff_info: HandoffInfo {
                source_stage: from,
                target_stage: to,
                handoff_id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                campaign_id: campaign_id.clone(),
                campaign_path: store.canonical().to_string(),
                trace_id: context.trace_id.clone(),
                format_version: self.format_version.clone(),
                execution_duration_ms,
            },
            campaign_context: snapshot(context),
            workflow_status: WorkflowStatus {
                completion_percentage: completion_percentage(stages.len(), Stage::ALL.len()),
                completed_stages: stages,
                current_stage: from,
                next_stage: to,
                phase: context.current_phase.to_string(),
            },
            specialist_outputs: outputs,
        };

        let (staged_path, bytes) = store.write_staged(&envelope).await?;
        debug!(
            campaign_id = %campaign_id,
            transition = %transition,
            bytes,
            "Handoff staged"
        );

        Ok(StagedHandoff {
            envelope,
            staged_path,
            bytes,
            started_at,
            started,
            transition,
            store,
            event_bus: self.event_bus.clone(),
            _lock: lock,
        })
    }
}

fn publish(bus: Option<&Arc<EventBus>>, event: PipelineEvent) {
    match bus {
        Some(bus) => bus.publish(event),
        None => debug!(event = ?event, "No event bus attached"),
    }
}

fn snapshot(context: &CampaignContext) -> CampaignSnapshot {
    let campaign = &context.campaign;
    CampaignSnapshot {
        id: campaign.id.clone(),
        name: campaign.name.clone(),
        brand: campaign.brand.clone(),
        language: campaign.language.clone(),
        campaign_type: campaign.campaign_type,
        storage_path: campaign.storage_path.clone(),
        request_id: context.request_id.clone(),
        correlation_id: context.correlation_id.clone(),
        workflow_type: context.workflow_type,
    }
}

fn chain_names<'a>(stages: impl Iterator<Item = &'a Stage>) -> Vec<String> {
    stages.map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CampaignRequest, ContextManager};
    use cadence_core::envelope::StageResult;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        builder: HandoffBuilder,
        manager: ContextManager,
        context: CampaignContext,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let builder = HandoffBuilder::new(
            CampaignPathResolver::new(dir.path()),
            &PipelineConfig::default(),
        );
        let manager = ContextManager::new();
        let context = manager
            .create_context(&CampaignRequest::new(
                "campaign_1000_abc",
                "campaigns/campaign_1000_abc/",
                "Acme",
            ))
            .unwrap();
        Fixture {
            _dir: dir,
            builder,
            manager,
            context,
        }
    }

    fn advance(f: &Fixture, ctx: &CampaignContext, output: &StageOutput) -> CampaignContext {
        f.manager
            .enhance_for_handoff(ctx, &StageResult::new(output.clone()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_handoff_contains_only_first_stage() {
        let f = fixture();
        let output = StageOutput::new().with("market", json!({"region": "EU"}));
        let ctx = advance(&f, &f.context, &output);

        let built = f
            .builder
            .commit(Stage::DataCollection, Some(Stage::Content), &ctx, &output, Some(42))
            .await
            .unwrap();

        let env = &built.envelope;
        assert_eq!(env.specialist_outputs.stages(), vec![Stage::DataCollection]);
        assert_eq!(env.workflow_status.completion_percentage, 20.0);
        assert_eq!(env.workflow_status.next_stage, Some(Stage::Content));
        assert_eq!(env.handoff_info.campaign_path, "campaigns/campaign_1000_abc/");
        assert_eq!(env.handoff_info.execution_duration_ms, Some(42));
        assert!(built.path.ends_with("handoffs/data-to-content.json"));
        assert!(built.superseded.is_none());
    }

    #[tokio::test]
    async fn test_accumulates_prior_outputs_unchanged() {
        let f = fixture();
        let data = StageOutput::new().with("market", json!({"region": "EU", "size": 3}));
        let ctx1 = advance(&f, &f.context, &data);
        f.builder
            .build(Stage::DataCollection, Some(Stage::Content), &ctx1, &data)
            .await
            .unwrap();

        let content = StageOutput::new()
            .with("subject_lines", json!(["Hi"]))
            .with("body", json!("Hello"));
        let ctx2 = advance(&f, &ctx1, &content);
        let env = f
            .builder
            .build(Stage::Content, Some(Stage::Design), &ctx2, &content)
            .await
            .unwrap();

        assert_eq!(
            env.specialist_outputs.stages(),
            vec![Stage::DataCollection, Stage::Content]
        );
        assert_eq!(env.specialist_outputs.get(Stage::DataCollection), Some(&data));
        assert_eq!(env.workflow_status.completion_percentage, 40.0);
    }

    #[tokio::test]
    async fn test_rejects_non_adjacent_transition() {
        let f = fixture();
        let output = StageOutput::new();
        let ctx = advance(&f, &f.context, &output);
        let err = f
            .builder
            .build(Stage::DataCollection, Some(Stage::Design), &ctx, &output)
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_requires_enhanced_context() {
        let f = fixture();
        let err = f
            .builder
            .build(Stage::DataCollection, Some(Stage::Content), &f.context, &StageOutput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::ChainMismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_previous_envelope_is_persistence_error() {
        let f = fixture();
        let data = StageOutput::new();
        let ctx1 = advance(&f, &f.context, &data);
        let ctx2 = advance(&f, &ctx1, &data);
        let err = f
            .builder
            .build(Stage::Content, Some(Stage::Design), &ctx2, &data)
            .await
            .unwrap_err();
        assert!(err.is_persistence_failure(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_rebuild_supersedes_previous_file() {
        let f = fixture();
        let output = StageOutput::new().with("market", json!({}));
        let ctx = advance(&f, &f.context, &output);

        let first = f
            .builder
            .commit(Stage::DataCollection, Some(Stage::Content), &ctx, &output, None)
            .await
            .unwrap();
        let second = f
            .builder
            .commit(Stage::DataCollection, Some(Stage::Content), &ctx, &output, None)
            .await
            .unwrap();

        assert_ne!(
            first.envelope.handoff_info.handoff_id,
            second.envelope.handoff_info.handoff_id
        );
        let archived = second.superseded.unwrap();
        assert!(archived
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("data-to-content.superseded-"));
        let archived_env: HandoffEnvelope =
            serde_json::from_slice(&std::fs::read(&archived).unwrap()).unwrap();
        assert_eq!(archived_env, first.envelope);
    }

    #[tokio::test]
    async fn test_rejected_candidate_keeps_committed_envelope() {
        let f = fixture();
        let output = StageOutput::new().with("market", json!({"region": "EU"}));
        let ctx = advance(&f, &f.context, &output);
        let committed = f
            .builder
            .build(Stage::DataCollection, Some(Stage::Content), &ctx, &output)
            .await
            .unwrap();

        let retry = StageOutput::new().with("market", json!({"region": "US"}));
        let staged = f
            .builder
            .stage(Stage::DataCollection, Some(Stage::Content), &ctx, &retry, None)
            .await
            .unwrap();
        let store = staged.store().clone();
        assert!(staged.staged_path.exists());
        assert_eq!(
            store.read_envelope(Stage::DataCollection, Some(Stage::Content)).await.unwrap(),
            committed
        );
        assert!(store.lock_path().exists());

        staged.reject().await.unwrap();
        assert!(!store.lock_path().exists());
        assert_eq!(
            store.read_envelope(Stage::DataCollection, Some(Stage::Content)).await.unwrap(),
            committed
        );
        assert_eq!(store.rejected_files().await.unwrap().len(), 1);
        assert!(store.superseded_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_rejects_build() {
        let f = fixture();
        let output = StageOutput::new();
        let ctx = advance(&f, &f.context, &output);
        let store = f.builder.store_for(&ctx).unwrap();
        let _held = store
            .acquire_lock("campaign_1000_abc", "data-to-content")
            .await
            .unwrap();

        let err = f
            .builder
            .build(Stage::DataCollection, Some(Stage::Content), &ctx, &output)
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::HandoffInProgress { .. }));
        assert!(!store
            .envelope_path(Stage::DataCollection, Some(Stage::Content))
            .exists());
    }

    #[tokio::test]
    async fn test_publishes_commit_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let builder = HandoffBuilder::new(
            CampaignPathResolver::new(dir.path()),
            &PipelineConfig::default(),
        )
        .with_event_bus(bus);
        let manager = ContextManager::new();
        let ctx = manager
            .create_context(&CampaignRequest::new("c1", "campaigns/c1", "Acme"))
            .unwrap();
        let output = StageOutput::new();
        let ctx = manager
            .enhance_for_handoff(&ctx, &StageResult::new(output.clone()))
            .unwrap();

        builder
            .build(Stage::DataCollection, Some(Stage::Content), &ctx, &output)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            PipelineEvent::HandoffCommitted { transition, bytes, .. } => {
                assert_eq!(transition, "data-to-content");
                assert!(bytes > 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
