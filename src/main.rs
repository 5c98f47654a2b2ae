mod doctor;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cadence_core::config::AppConfig;
use cadence_core::metadata::CampaignStatus;
use cadence_core::report::{ContinuityReport, ValidationResult};
use cadence_core::types::{CampaignType, WorkflowType};

use cadence_pipeline::{
    CampaignPathResolver, CampaignPipeline, CampaignRequest, CampaignStore, ContinuityAnalyzer,
    HaltReport, HandoffMonitor, HandoffValidator,
};

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Handoff orchestration for multi-stage email campaigns"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a campaign directory and its initial metadata
    Init {
        /// Campaign id (e.g. campaign_1000_abc)
        id: String,
        /// Brand the campaign belongs to
        #[arg(long)]
        brand: String,
        /// Human-readable campaign name
        #[arg(long)]
        name: Option<String>,
        /// Content language
        #[arg(long)]
        language: Option<String>,
        /// Campaign type (promotional, transactional, newsletter, announcement)
        #[arg(long)]
        campaign_type: Option<String>,
        /// Storage path relative to the campaigns root (default: campaigns/<id>/)
        #[arg(long)]
        storage_path: Option<String>,
        /// Workflow type (full-pipeline, single-stage, test, partial)
        #[arg(long, default_value = "full-pipeline")]
        workflow: String,
        /// Number of stages for partial workflows
        #[arg(long)]
        phases: Option<usize>,
    },
    /// Show a campaign's progress, or why it halted
    Status {
        /// Campaign id or campaign path
        campaign: String,
    },
    /// Run the four validation layers against an envelope file
    Validate {
        /// Envelope JSON file
        file: PathBuf,
        /// Campaign path the envelope is expected to belong to
        #[arg(long)]
        campaign_path: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Score context preservation across a campaign's handoff chain
    Continuity {
        /// Campaign id or campaign path
        campaign: String,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recorded handoff metrics for a campaign
    Summary {
        /// Campaign id or campaign path
        campaign: String,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config,
    /// Run configuration and environment checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadence=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cadence", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init {
            id,
            brand,
            name,
            language,
            campaign_type,
            storage_path,
            workflow,
            phases,
        } => {
            let storage_path = storage_path.unwrap_or_else(|| format!("campaigns/{}/", id));
            let workflow: WorkflowType = serde_json::from_value(json!(workflow))
                .with_context(|| format!("unknown workflow type '{}'", workflow))?;
            let mut request = CampaignRequest::new(id, storage_path, brand)
                .with_workflow(workflow, phases);
            if let Some(name) = name {
                request = request.with_name(name);
            }
            if let Some(language) = language {
                request = request.with_language(language);
            }
            if let Some(kind) = campaign_type {
                let kind: CampaignType = serde_json::from_value(json!(kind))
                    .with_context(|| format!("unknown campaign type '{}'", kind))?;
                request = request.with_type(kind);
            }

            let pipeline = CampaignPipeline::new(config)?;
            let context = pipeline.start(&request).await?;
            let store = pipeline.store_for(&context)?;
            println!("Created {} at {}", context.campaign.id, store.dir().display());
        }
        Commands::Status { campaign } => {
            let store = open_store(&config, &campaign)?;
            print_status(&store).await?;
        }
        Commands::Validate {
            file,
            campaign_path,
            json,
        } => {
            let validator = HandoffValidator::from_config(&config);
            let campaign_path = match campaign_path {
                Some(path) => path,
                None => envelope_campaign_path(&file)?,
            };
            let result = validator.validate_file(&file, &campaign_path).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_validation(&file, &result);
            }
            if !result.is_valid {
                anyhow::bail!("{} failed validation", file.display());
            }
        }
        Commands::Continuity { campaign, json } => {
            let store = open_store(&config, &campaign)?;
            let analyzer = ContinuityAnalyzer::from_config(&config)?;
            let report = analyzer.analyze_store(&store).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_continuity(&report, analyzer.threshold());
            }
        }
        Commands::Summary { campaign, json } => {
            let store = open_store(&config, &campaign)?;
            let metadata = store
                .read_metadata()
                .await
                .with_context(|| format!("no campaign metadata under {}", store.dir().display()))?;
            if config.metrics_db_path().is_none() {
                warn!("monitor.metrics_db is not set; only this process's records are visible");
            }
            let monitor = HandoffMonitor::from_config(&config);
            let summary = monitor.summarize(&metadata.id);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Campaign {}", summary.campaign_id);
                println!(
                    "  handoffs: {} ({} ok, {} failed, {:.1}% success)",
                    summary.total_handoffs,
                    summary.successful_handoffs,
                    summary.failed_handoffs,
                    summary.success_rate
                );
                println!(
                    "  duration: avg {:.1} ms, max {} ms, validation avg {:.1} ms",
                    summary.average_duration_ms, summary.max_duration_ms, summary.average_validation_ms
                );
                println!("  bytes transferred: {}", summary.total_bytes_transferred);
                for stats in &summary.transitions {
                    println!(
                        "  {:<22} {} attempts, {} failed, avg {:.1} ms",
                        stats.transition, stats.attempts, stats.failures, stats.average_duration_ms
                    );
                }
                for alert in &summary.alerts {
                    println!("  [!!] {}", alert.message);
                }
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            println!("Cadence Doctor");
            println!("==============");
            doctor::run_doctor(&config);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".cadence").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    let config = AppConfig::default();
    config.validate()?;
    Ok(config)
}

/// Accept either a bare campaign id or a campaign path.
fn open_store(config: &AppConfig, campaign: &str) -> anyhow::Result<CampaignStore> {
    let resolver = CampaignPathResolver::new(config.campaigns_root());
    let input = if campaign.contains('/') {
        json!(campaign)
    } else {
        json!({ "campaignId": campaign })
    };
    let canonical = resolver.resolve(&input)?;
    Ok(CampaignStore::open(
        &resolver,
        &canonical,
        config.pipeline.io_timeout(),
    ))
}

fn envelope_campaign_path(file: &Path) -> anyhow::Result<String> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not JSON", file.display()))?;
    value["handoff_info"]["campaign_path"]
        .as_str()
        .map(str::to_string)
        .context("envelope has no handoff_info.campaign_path; pass --campaign-path")
}

async fn print_status(store: &CampaignStore) -> anyhow::Result<()> {
    let metadata = store
        .read_metadata()
        .await
        .with_context(|| format!("no campaign metadata under {}", store.dir().display()))?;
    let chain = store.load_chain().await?;

    println!("Campaign {} ({})", metadata.id, metadata.brand);
    if !metadata.name.is_empty() {
        println!("  name:   {}", metadata.name);
    }
    println!("  status: {:?}", metadata.status);
    println!("  phase:  {}", metadata.workflow_phase);
    for (stage, done) in &metadata.specialists_completed {
        println!("  {} {}", if *done { "[OK]" } else { "[  ]" }, stage);
    }
    println!("  envelopes: {}", chain.len());
    if let Some(latest) = chain.last() {
        println!(
            "  latest:    {} ({:.0}%)",
            latest.file_name(),
            latest.workflow_status.completion_percentage
        );
    }
    if let Some(holder) = store.lock_holder().await {
        println!("  lock:      held for {} by pid {}", holder.transition, holder.pid);
    }

    if metadata.status == CampaignStatus::Failed {
        if let Some(report) = HaltReport::from_metadata(&metadata) {
            println!();
            println!("  Halted at {} during {}", report.transition, report.workflow_phase);
            for finding in &report.findings {
                println!("  [!!] {}", finding);
            }
        }
    }
    Ok(())
}

fn print_validation(file: &Path, result: &ValidationResult) {
    let icon = if result.is_valid { "[OK]" } else { "[!!]" };
    println!("  {} {}", icon, file.display());
    for layer in result.failing_layers() {
        println!("  failing layer: {}", layer);
    }
    for finding in result.all_findings() {
        println!("  [!!] {}", finding);
    }
    for warning in &result.warnings {
        println!("  [--] {}", warning);
    }
}

fn print_continuity(report: &ContinuityReport, threshold: f64) {
    println!(
        "Continuity score: {:.1} (threshold {:.0})",
        report.continuity_score, threshold
    );
    for t in &report.transitions {
        let icon = if t.score >= threshold { "[OK]" } else { "[!!]" };
        println!(
            "  {} {:<22} {:>5.1}  fields {:.0}%  non-empty {:.0}%  preserved {:.0}%",
            icon,
            t.transition,
            t.score,
            t.field_presence * 100.0,
            t.non_empty_ratio * 100.0,
            t.preservation * 100.0
        );
    }
    for issue in &report.continuity_issues {
        println!(
            "  {:?}/{:?} at {}: {}",
            issue.severity, issue.issue_type, issue.transition, issue.description
        );
    }
    for rec in &report.recommendations {
        println!("  -> {}", rec);
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
