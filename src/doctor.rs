use cadence_core::config::AppConfig;
use cadence_core::metadata::{CampaignMetadata, CampaignStatus, METADATA_FILE};
use cadence_core::types::Stage;
use cadence_pipeline::store::LOCK_FILE;
use cadence_pipeline::path::HANDOFFS_DIR;
use cadence_pipeline::MetricsStore;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &AppConfig) {
    let checks = vec![
        check_config(config),
        check_campaigns_root(config),
        check_metrics_db(config),
        check_schema(config),
        check_campaigns(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_config(config: &AppConfig) -> CheckResult {
    match config.validate() {
        Ok(()) => {
            let weights = config
                .continuity
                .normalized_weights()
                .map(|(f, n, p)| format!("weights {:.2}/{:.2}/{:.2}", f, n, p))
                .unwrap_or_default();
            CheckResult {
                label: "Config".into(),
                ok: true,
                detail: format!(
                    "{}, threshold {:.0}, io timeout {}s",
                    weights, config.continuity.threshold, config.pipeline.io_timeout_secs
                ),
            }
        }
        Err(e) => CheckResult {
            label: "Config".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_campaigns_root(config: &AppConfig) -> CheckResult {
    let root = config.campaigns_root();
    if !root.is_dir() {
        return CheckResult {
            label: "Campaigns root".into(),
            ok: false,
            detail: format!("{} (does not exist)", root.display()),
        };
    }

    let marker = root.join(".doctor_write_check");
    match std::fs::write(&marker, "marker") {
        Ok(_) => {
            std::fs::remove_file(&marker).ok();
            CheckResult {
                label: "Campaigns root".into(),
                ok: true,
                detail: format!("{}", root.display()),
            }
        }
        Err(e) => CheckResult {
            label: "Campaigns root".into(),
            ok: false,
            detail: format!("{} (not writable: {})", root.display(), e),
        },
    }
}

fn check_metrics_db(config: &AppConfig) -> CheckResult {
    let Some(path) = config.metrics_db_path() else {
        return CheckResult {
            label: "Metrics".into(),
            ok: true,
            detail: "In-memory only (monitor.metrics_db not set)".into(),
        };
    };
    match MetricsStore::open(&path).and_then(|store| store.count()) {
        Ok(count) => CheckResult {
            label: "Metrics".into(),
            ok: true,
            detail: format!("{} ({} records)", path.display(), count),
        },
        Err(e) => CheckResult {
            label: "Metrics".into(),
            ok: false,
            detail: format!("{}: {}", path.display(), e),
        },
    }
}

fn check_schema(config: &AppConfig) -> CheckResult {
    let empty: Vec<&str> = Stage::ALL
        .iter()
        .filter(|stage| config.validation.required_fields_for(**stage).is_empty())
        .map(|stage| stage.as_str())
        .collect();

    if empty.is_empty() {
        CheckResult {
            label: "Stage schema".into(),
            ok: true,
            detail: format!("required fields set for all {} stages", Stage::ALL.len()),
        }
    } else {
        CheckResult {
            label: "Stage schema".into(),
            ok: false,
            detail: format!("no required fields for: {}", empty.join(", ")),
        }
    }
}

fn check_campaigns(config: &AppConfig) -> CheckResult {
    let dir = config.campaigns_root().join("campaigns");
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => {
            return CheckResult {
                label: "Campaigns".into(),
                ok: true,
                detail: format!("none under {}", dir.display()),
            }
        }
    };

    let mut total = 0;
    let mut failed = Vec::new();
    let mut locked = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(raw) = std::fs::read_to_string(path.join(METADATA_FILE)) else {
            continue;
        };
        let Ok(metadata) = serde_json::from_str::<CampaignMetadata>(&raw) else {
            failed.push(format!("{} (unreadable metadata)", path.display()));
            continue;
        };
        total += 1;
        if metadata.status == CampaignStatus::Failed {
            failed.push(format!(
                "{} at {}",
                metadata.id,
                metadata.failed_transition.as_deref().unwrap_or("?")
            ));
        }
        if path.join(HANDOFFS_DIR).join(LOCK_FILE).exists() {
            locked.push(metadata.id.to_string());
        }
    }

    let mut detail = format!("{} found", total);
    if !failed.is_empty() {
        detail.push_str(&format!("; halted: {}", failed.join(", ")));
    }
    if !locked.is_empty() {
        detail.push_str(&format!("; lock held: {}", locked.join(", ")));
    }
    CheckResult {
        label: "Campaigns".into(),
        ok: failed.is_empty() && locked.is_empty(),
        detail,
    }
}
