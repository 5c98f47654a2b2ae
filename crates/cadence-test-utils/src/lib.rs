//! Shared fixtures for cadence tests: a throwaway campaigns root, stage
//! outputs that satisfy the default schema, and a scripted stage worker.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use cadence_core::config::AppConfig;
use cadence_core::envelope::{SpecialistOutputs, StageOutput, StageResult};
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::StageWorker;
use cadence_core::types::{CampaignContext, Stage};

/// Campaign id used throughout the fixtures.
pub const SAMPLE_CAMPAIGN_ID: &str = "campaign_1000_abc";

/// A temporary campaigns root. Removed when dropped.
pub struct TempCampaign {
    dir: tempfile::TempDir,
    pub campaign_id: String,
}

impl TempCampaign {
    pub fn new() -> Self {
        Self::with_id(SAMPLE_CAMPAIGN_ID)
    }

    pub fn with_id(campaign_id: &str) -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp campaigns root"),
            campaign_id: campaign_id.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Canonical relative campaign path, `campaigns/<id>/`.
    pub fn canonical(&self) -> String {
        format!("campaigns/{}/", self.campaign_id)
    }

    /// Absolute campaign directory.
    pub fn campaign_dir(&self) -> PathBuf {
        self.root().join("campaigns").join(&self.campaign_id)
    }

    /// Default config rooted at this directory, without SQLite persistence.
    pub fn config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.pipeline.campaigns_root = self.root().display().to_string();
        config.pipeline.io_timeout_secs = 5;
        config.monitor.metrics_db = None;
        config
    }

    /// Write `contents` to `relative` under the campaign directory.
    pub fn write_file(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.campaign_dir().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(&path, contents).expect("write campaign file");
        path
    }
}

impl Default for TempCampaign {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliverables that satisfy the default required fields and count rules
/// for `stage`.
pub fn sample_output(stage: Stage) -> StageOutput {
    match stage {
        Stage::DataCollection => StageOutput::new()
            .with("market", json!({ "region": "EU", "segment": "retail" }))
            .with("destinations", json!(["Lisbon", "Porto"]))
            .with("destination_count", json!(2))
            .with_preserved("market.region"),
        Stage::Content => StageOutput::new()
            .with("subject_lines", json!(["Spring is here", "Last chance"]))
            .with("subject_line_count", json!(2))
            .with("body", json!("Discover our spring offers."))
            .with("language", json!("en")),
        Stage::Design => StageOutput::new()
            .with("template", json!({ "name": "spring-hero", "columns": 2 }))
            .with("assets", json!(["hero.png"]))
            .with("required_asset_count", json!(1)),
        Stage::Quality => StageOutput::new()
            .with("score", json!(92))
            .with("approved", json!(true)),
        Stage::Delivery => StageOutput::new()
            .with("exports", json!(["campaign.html", "campaign.txt"]))
            .with("export_count", json!(2)),
    }
}

pub fn sample_result(stage: Stage) -> StageResult {
    StageResult::new(sample_output(stage))
}

/// What a [`ScriptedWorker`] does when run.
#[derive(Clone)]
pub enum Script {
    /// Return this result.
    Return(StageResult),
    /// Fail with a configuration error carrying this message.
    Fail(String),
    /// Sleep, then return the result.
    Delay(Duration, StageResult),
}

/// A stage worker that replays a fixed script and records what it saw.
pub struct ScriptedWorker {
    stage: Stage,
    script: Script,
    timeout_secs: u64,
    calls: AtomicUsize,
    seen_prior: Mutex<Vec<Vec<Stage>>>,
}

impl ScriptedWorker {
    pub fn new(stage: Stage, script: Script) -> Self {
        Self {
            stage,
            script,
            timeout_secs: 0,
            calls: AtomicUsize::new(0),
            seen_prior: Mutex::new(vec![]),
        }
    }

    /// Worker that returns [`sample_result`] for its stage.
    pub fn sample(stage: Stage) -> Self {
        Self::new(stage, Script::Return(sample_result(stage)))
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stages present in the prior outputs of each call.
    pub fn seen_prior(&self) -> Vec<Vec<Stage>> {
        self.seen_prior.lock().expect("seen_prior lock").clone()
    }
}

impl StageWorker for ScriptedWorker {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn run<'a>(
        &'a self,
        _context: &'a CampaignContext,
        prior_outputs: &'a SpecialistOutputs,
    ) -> BoxFuture<'a, Result<StageResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_prior
                .lock()
                .expect("seen_prior lock")
                .push(prior_outputs.stages());
            match &self.script {
                Script::Return(result) => Ok(result.clone()),
                Script::Fail(message) => Err(CadenceError::Configuration(message.clone())),
                Script::Delay(delay, result) => {
                    tokio::time::sleep(*delay).await;
                    Ok(result.clone())
                }
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

/// One sample worker per pipeline stage.
pub fn sample_workers() -> Vec<Arc<dyn StageWorker>> {
    Stage::ALL
        .iter()
        .map(|stage| Arc::new(ScriptedWorker::sample(*stage)) as Arc<dyn StageWorker>)
        .collect()
}
