use std::io::Write;

use cadence_core::config::AppConfig;
use cadence_core::types::Stage;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[pipeline]
campaigns_root = "/srv/campaigns"
io_timeout_secs = 3
create_layout = false

[validation]
check_writable = false

[validation.required_fields]
content = ["subject_lines", "body", "preheader"]

[[validation.count_rules.design]]
count_key = "module_count"
list_key = "modules"

[continuity]
field_presence_weight = 2.0
non_empty_weight = 1.0
preserved_weight = 1.0
threshold = 80.0
critical_gap = 15.0

[monitor]
metrics_db = "/var/lib/cadence/metrics.db"
slow_handoff_ms = 2500
log_level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.pipeline.campaigns_root, "/srv/campaigns");
    assert_eq!(config.pipeline.io_timeout_secs, 3);
    assert!(!config.pipeline.create_layout);
    assert!(!config.validation.check_writable);

    assert_eq!(
        config.validation.required_fields_for(Stage::Content),
        vec!["subject_lines", "body", "preheader"]
    );
    // Stages without an override keep the built-in schema.
    assert_eq!(config.validation.required_fields_for(Stage::Design), vec!["template"]);
    let design_rules = config.validation.count_rules_for(Stage::Design);
    assert_eq!(design_rules.len(), 1);
    assert_eq!(design_rules[0].count_key, "module_count");

    let (f, n, p) = config.continuity.normalized_weights().unwrap();
    assert!((f - 0.5).abs() < 1e-9);
    assert!((n - 0.25).abs() < 1e-9);
    assert!((p - 0.25).abs() < 1e-9);
    assert_eq!(config.continuity.threshold, 80.0);

    assert_eq!(
        config.metrics_db_path().unwrap().to_str(),
        Some("/var/lib/cadence/metrics.db")
    );
    assert_eq!(config.monitor.slow_handoff_ms, 2500);
    assert_eq!(config.monitor.log_level, 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CADENCE_TEST_ROOT", "/tmp/cadence-expanded");

    let toml_content = r#"
[pipeline]
campaigns_root = "${CADENCE_TEST_ROOT}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.pipeline.campaigns_root, "/tmp/cadence-expanded");

    std::env::remove_var("CADENCE_TEST_ROOT");
}

#[test]
fn test_empty_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.pipeline.io_timeout_secs, 10);
    assert_eq!(config.pipeline.format_version, "1.0");
    assert!(config.pipeline.create_layout);
    assert!(config.validation.check_writable);
    assert_eq!(config.continuity.threshold, 70.0);
    assert!(config.monitor.enabled);
    assert!(config.monitor.metrics_db.is_none());
    assert_eq!(config.monitor.log_level, 2);
    assert_eq!(
        config.validation.required_fields_for(Stage::Delivery),
        vec!["exports"]
    );
}

#[test]
fn test_unknown_stage_in_validation_is_rejected() {
    let toml_content = r#"
[validation.required_fields]
pricing = ["tiers"]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("pricing"));
}

#[test]
fn test_zero_weights_are_rejected() {
    let toml_content = r#"
[continuity]
field_presence_weight = 0.0
non_empty_weight = 0.0
preserved_weight = 0.0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    assert!(AppConfig::load(tmp.path()).is_err());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/cadence.toml")).unwrap_err();
    assert!(matches!(err, cadence_core::CadenceError::ConfigNotFound(_)));
}
