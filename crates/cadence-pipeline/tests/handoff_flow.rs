use std::sync::Arc;

use serde_json::json;

use cadence_core::config::AppConfig;
use cadence_core::envelope::StageResult;
use cadence_core::error::CadenceError;
use cadence_core::metadata::CampaignStatus;
use cadence_core::types::{CampaignContext, Phase, Stage};
use cadence_pipeline::{
    CampaignPipeline, CampaignPathResolver, CampaignRequest, CampaignStore, ContextManager,
    HandoffBuilder, LockInfo,
};
use cadence_test_utils::{sample_output, sample_result, TempCampaign};

fn request(campaign: &TempCampaign) -> CampaignRequest {
    CampaignRequest::new(campaign.campaign_id.clone(), campaign.canonical(), "Acme")
        .with_name("Spring launch")
}

fn store(campaign: &TempCampaign, config: &AppConfig) -> CampaignStore {
    let resolver = CampaignPathResolver::new(config.campaigns_root());
    CampaignStore::open(&resolver, &campaign.canonical(), config.pipeline.io_timeout())
}

#[tokio::test]
async fn test_round_trip_accumulates_outputs() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();

    let ctx = pipeline.start(&request(&campaign)).await.unwrap();
    assert_eq!(ctx.current_phase, Phase::DataCollection);
    assert_eq!(ctx.phase_index, 0);

    let first = pipeline
        .advance(&ctx, &sample_result(Stage::DataCollection), Some(5))
        .await
        .unwrap();
    assert!(first.validation.is_valid);
    assert_eq!(first.envelope.file_name(), "data-to-content.json");
    assert_eq!(first.context.phase_index, 1);
    assert_eq!(first.context.current_phase, Phase::Content);

    let second = pipeline
        .advance(&first.context, &sample_result(Stage::Content), Some(7))
        .await
        .unwrap();
    let env = &second.envelope;
    assert_eq!(env.file_name(), "content-to-design.json");
    assert_eq!(
        env.specialist_outputs.stages(),
        vec![Stage::DataCollection, Stage::Content]
    );
    assert_eq!(
        env.specialist_outputs.get(Stage::DataCollection),
        Some(&sample_output(Stage::DataCollection))
    );
    assert_eq!(env.workflow_status.completion_percentage, 40.0);
    assert_eq!(env.handoff_info.campaign_path, campaign.canonical());
    assert_eq!(second.context.completion_percentage(), 40.0);

    let store = store(&campaign, &config);
    let chain = store.load_chain().await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(&chain[1], env);

    let metadata = store.read_metadata().await.unwrap();
    assert_eq!(metadata.status, CampaignStatus::InProgress);
    assert_eq!(metadata.workflow_phase, Phase::Design);
    assert_eq!(
        metadata.completed_stages(),
        vec![Stage::DataCollection, Stage::Content]
    );
}

#[tokio::test]
async fn test_missing_dependency_halts_with_diagnostic() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();

    let ctx = pipeline.start(&request(&campaign)).await.unwrap();
    let ctx = pipeline
        .advance(&ctx, &sample_result(Stage::DataCollection), None)
        .await
        .unwrap()
        .context;

    let content = StageResult::new(sample_output(Stage::Content).with_file("pricing-analysis.json"));
    let err = pipeline.advance(&ctx, &content, None).await.unwrap_err();

    match &err {
        CadenceError::DependencyValidation { transition, result } => {
            assert_eq!(transition, "content-to-design");
            assert!(!result.is_valid);
            assert_eq!(result.missing_dependencies, vec!["pricing-analysis.json".to_string()]);
        }
        other => panic!("expected dependency failure, got {other:?}"),
    }

    let store = store(&campaign, &config);
    assert!(store
        .try_read_envelope(Stage::Content, Some(Stage::Design))
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.rejected_files().await.unwrap().len(), 1);
    assert_eq!(store.load_chain().await.unwrap().len(), 1);

    let report = pipeline.halt_report(&ctx).await.unwrap().unwrap();
    assert_eq!(report.workflow_phase, Phase::Content);
    assert_eq!(report.transition, "content-to-design");
    assert!(report
        .findings
        .iter()
        .any(|f| f.contains("pricing-analysis.json")));
}

#[tokio::test]
async fn test_present_dependency_passes() {
    let campaign = TempCampaign::new();
    let pipeline = CampaignPipeline::new(campaign.config()).unwrap();

    let ctx = pipeline.start(&request(&campaign)).await.unwrap();
    campaign.write_file("data/pricing-analysis.json", r#"{"tiers": 3}"#);

    let data = StageResult::new(
        sample_output(Stage::DataCollection).with_file("data/pricing-analysis.json"),
    );
    let advance = pipeline.advance(&ctx, &data, None).await.unwrap();
    assert!(advance.validation.missing_dependencies.is_empty());
}

#[tokio::test]
async fn test_rejected_quality_stops_before_delivery() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();

    let mut ctx = pipeline.start(&request(&campaign)).await.unwrap();
    for stage in [Stage::DataCollection, Stage::Content, Stage::Design] {
        ctx = pipeline
            .advance(&ctx, &sample_result(stage), None)
            .await
            .unwrap()
            .context;
    }

    let rejected = StageResult::new(sample_output(Stage::Quality).with("approved", json!(false)));
    let err = pipeline.advance(&ctx, &rejected, None).await.unwrap_err();
    assert!(matches!(err, CadenceError::ConsistencyValidation { .. }));

    let metadata = store(&campaign, &config).read_metadata().await.unwrap();
    assert_eq!(metadata.status, CampaignStatus::Failed);
    assert_eq!(metadata.failed_transition.as_deref(), Some("quality-to-delivery"));
}

#[tokio::test]
async fn test_phase_index_never_decreases() {
    let campaign = TempCampaign::new();
    let pipeline = CampaignPipeline::new(campaign.config()).unwrap();

    let mut ctx = pipeline.start(&request(&campaign)).await.unwrap();
    let mut seen: Vec<CampaignContext> = vec![ctx.clone()];
    for stage in Stage::ALL {
        ctx = pipeline
            .advance(&ctx, &sample_result(stage), None)
            .await
            .unwrap()
            .context;
        seen.push(ctx.clone());
    }

    for pair in seen.windows(2) {
        ContextManager::ensure_monotonic(&pair[0], &pair[1]).unwrap();
        assert_eq!(pair[1].phase_index, pair[0].phase_index + 1);
    }
    assert_eq!(ctx.current_phase, Phase::Orchestration);
    assert_eq!(ctx.completion_percentage(), 100.0);

    let err = pipeline
        .advance(&ctx, &sample_result(Stage::Delivery), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::Configuration(_)));
}

#[tokio::test]
async fn test_concurrent_writers_commit_one_file() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();
    let ctx = pipeline.start(&request(&campaign)).await.unwrap();

    let contexts = ContextManager::new();
    let result = sample_result(Stage::DataCollection);
    let enhanced = contexts.enhance_for_handoff(&ctx, &result).unwrap();

    let resolver = CampaignPathResolver::new(config.campaigns_root());
    let builder = Arc::new(HandoffBuilder::new(resolver, &config.pipeline));

    let attempts = (0..8).map(|_| {
        let builder = builder.clone();
        let enhanced = enhanced.clone();
        let output = result.output.clone();
        tokio::spawn(async move {
            builder
                .build(Stage::DataCollection, Some(Stage::Content), &enhanced, &output)
                .await
        })
    });
    let outcomes = futures::future::join_all(attempts).await;

    let mut successes = 0;
    for outcome in outcomes {
        match outcome.unwrap() {
            Ok(_) => successes += 1,
            Err(CadenceError::HandoffInProgress { transition, .. }) => {
                assert_eq!(transition, "data-to-content");
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(successes >= 1);

    let store = store(&campaign, &config);
    let committed = store
        .read_envelope(Stage::DataCollection, Some(Stage::Content))
        .await
        .unwrap();
    assert_eq!(committed.specialist_outputs.stages(), vec![Stage::DataCollection]);
    assert_eq!(store.superseded_files().await.unwrap().len(), successes - 1);
    assert!(!store.lock_path().exists());
}

#[tokio::test]
async fn test_resume_refuses_unvalidated_envelope() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();
    let ctx = pipeline.start(&request(&campaign)).await.unwrap();

    let output = sample_output(Stage::DataCollection).with_file("data/pricing-analysis.json");
    let enhanced = ContextManager::new()
        .enhance_for_handoff(&ctx, &StageResult::new(output.clone()))
        .unwrap();
    let builder = HandoffBuilder::new(
        CampaignPathResolver::new(config.campaigns_root()),
        &config.pipeline,
    );
    builder
        .build(Stage::DataCollection, Some(Stage::Content), &enhanced, &output)
        .await
        .unwrap();

    let err = pipeline.resume(&request(&campaign)).await.unwrap_err();
    match &err {
        CadenceError::DependencyValidation { transition, result } => {
            assert_eq!(transition, "data-to-content");
            assert_eq!(
                result.missing_dependencies,
                vec!["data/pricing-analysis.json".to_string()]
            );
        }
        other => panic!("expected dependency failure, got {other:?}"),
    }

    let store = store(&campaign, &config);
    assert!(store.load_chain().await.unwrap().is_empty());
    assert_eq!(store.rejected_files().await.unwrap().len(), 1);
    let metadata = store.read_metadata().await.unwrap();
    assert_eq!(metadata.status, CampaignStatus::Failed);
    assert_eq!(metadata.failed_transition.as_deref(), Some("data-to-content"));

    let restarted = pipeline.resume(&request(&campaign)).await.unwrap();
    assert_eq!(restarted.current_phase, Phase::DataCollection);
    assert!(restarted.handoff_chain.is_empty());
}

#[tokio::test]
async fn test_abandoned_candidate_is_invisible_to_resume() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();
    let ctx = pipeline.start(&request(&campaign)).await.unwrap();

    let result = sample_result(Stage::DataCollection);
    let enhanced = ContextManager::new().enhance_for_handoff(&ctx, &result).unwrap();
    let builder = HandoffBuilder::new(
        CampaignPathResolver::new(config.campaigns_root()),
        &config.pipeline,
    );
    let staged = builder
        .stage(Stage::DataCollection, Some(Stage::Content), &enhanced, &result.output, None)
        .await
        .unwrap();
    let staged_path = staged.staged_path.clone();
    drop(staged);

    let store = store(&campaign, &config);
    assert!(staged_path.exists());
    assert!(!store.lock_path().exists());
    assert!(store.load_chain().await.unwrap().is_empty());

    let resumed = pipeline.resume(&request(&campaign)).await.unwrap();
    assert_eq!(resumed.current_phase, Phase::DataCollection);

    let advance = pipeline.advance(&resumed, &result, None).await.unwrap();
    assert_eq!(advance.envelope.file_name(), "data-to-content.json");
    assert!(!staged_path.exists());
}

#[tokio::test]
async fn test_rejected_retry_keeps_accepted_envelope() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();
    let ctx = pipeline.start(&request(&campaign)).await.unwrap();

    let accepted = pipeline
        .advance(&ctx, &sample_result(Stage::DataCollection), None)
        .await
        .unwrap();

    let retry = StageResult::new(sample_output(Stage::DataCollection).with_file("data/nope.json"));
    let err = pipeline.advance(&ctx, &retry, None).await.unwrap_err();
    assert!(matches!(err, CadenceError::DependencyValidation { .. }));

    let store = store(&campaign, &config);
    let chain = store.load_chain().await.unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0], accepted.envelope);
    assert!(store.superseded_files().await.unwrap().is_empty());
    assert_eq!(store.rejected_files().await.unwrap().len(), 1);

    let resumed = pipeline.resume(&request(&campaign)).await.unwrap();
    assert_eq!(resumed.current_phase, Phase::Content);
    assert_eq!(resumed.handoff_chain, vec![Stage::DataCollection]);
}

#[tokio::test]
async fn test_lock_left_by_dead_writer_does_not_block_advance() {
    let campaign = TempCampaign::new();
    let config = campaign.config();
    let pipeline = CampaignPipeline::new(config.clone()).unwrap();
    let ctx = pipeline.start(&request(&campaign)).await.unwrap();

    let store = store(&campaign, &config);
    let abandoned = LockInfo {
        transition: "data-to-content".into(),
        pid: u32::MAX,
        acquired_at: chrono::Utc::now() - chrono::Duration::hours(2),
    };
    std::fs::write(store.lock_path(), serde_json::to_vec(&abandoned).unwrap()).unwrap();

    let advance = pipeline
        .advance(&ctx, &sample_result(Stage::DataCollection), None)
        .await
        .unwrap();
    assert!(advance.validation.is_valid);
    assert!(!store.lock_path().exists());
}
