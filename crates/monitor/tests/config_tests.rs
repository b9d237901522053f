//! Integration tests for monitor configuration files

use common::IdentityScope;
use monitor::MonitorConfig;
use monitor::config::DiffPolicy;

const MINIMAL_CONFIG: &str = r#"
[monitor]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
filters = ["0x046d:*", "!0x046d:0x0825", "0x1234:0x5678"]

[monitor]
log_level = "debug"
identity_scope = "model"
state_path = "~/.local/share/usb-session/state.json"

[polling]
initial_delay_ms = 50
fast_interval_ms = 1000
slow_interval_ms = 2000
diff_policy = "count_only"

[open_retry]
max_retries = 5
initial_backoff_ms = 100
backoff_step_ms = 50

[permission]
first_activation_retry_ms = 750
reset_on_first_activation = false
reset_settle_ms = 0
"#;

#[test]
fn test_minimal_config_uses_defaults() {
    let config: MonitorConfig = toml::from_str(MINIMAL_CONFIG).unwrap();

    assert!(config.filters.is_empty());
    assert_eq!(config.monitor.identity_scope, IdentityScope::Extended);
    assert_eq!(config.polling.initial_delay_ms, 100);
    assert_eq!(config.polling.diff_policy, DiffPolicy::SetDifference);
    assert_eq!(config.open_retry.max_retries, 3);
    assert!(config.permission.reset_on_first_activation);
    assert!(config.validate().is_ok());
}

#[test]
fn test_full_config() {
    let config: MonitorConfig = toml::from_str(FULL_CONFIG).unwrap();
    assert!(config.validate().is_ok());

    let filters = config.parsed_filters().unwrap();
    assert_eq!(filters.len(), 3);
    assert!(filters[1].exclude);
    assert_eq!(filters[0].product_id, None);

    assert_eq!(config.monitor.identity_scope, IdentityScope::Model);
    assert_eq!(config.polling.diff_policy, DiffPolicy::CountOnly);

    let policy = config.open_retry.policy();
    assert_eq!(policy.max_retries, 5);
    assert_eq!(policy.delay_for(1), std::time::Duration::from_millis(150));

    assert_eq!(
        config.permission.first_activation_retry(),
        std::time::Duration::from_millis(750)
    );
    assert!(!config.state_path().to_string_lossy().contains('~'));
}

#[test]
fn test_invalid_diff_policy_rejected() {
    let result: Result<MonitorConfig, _> = toml::from_str(
        r#"
[polling]
diff_policy = "sometimes"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_save_and_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("monitor.toml");

    let mut config = MonitorConfig::default();
    config.filters = vec!["0x1234:*".into()];
    config.polling.diff_policy = DiffPolicy::CountOnly;
    config.save(&path).unwrap();

    let loaded = MonitorConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.filters, vec!["0x1234:*".to_string()]);
    assert_eq!(loaded.polling.diff_policy, DiffPolicy::CountOnly);
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitor.toml");
    std::fs::write(&path, "filters = [\"0xZZZZ:*\"]\n").unwrap();

    let err = MonitorConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("ZZZZ"));
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(MonitorConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
