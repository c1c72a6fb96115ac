use std::io::Write;
use std::path::PathBuf;

use qaflow_core::config::AppConfig;
use qaflow_core::error::QaflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[workspace]
dir = "/tmp/qaflow-test"

[registry]
max_active = 25
max_age_days = 3
evict_finished = true

[engine]
max_node_visits = 8
step_timeout_secs = 120
event_buffer = 512

[generator]
graph_file = "/tmp/generated-graph.json"
objective = "checkout"

[log]
enabled = false
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.workspace_dir(), PathBuf::from("/tmp/qaflow-test"));
    assert_eq!(config.store_path(), PathBuf::from("/tmp/qaflow-test/sessions.db"));
    assert_eq!(config.registry.max_active, 25);
    assert_eq!(config.registry.max_age_days, 3);
    assert!(config.registry.evict_finished);
    assert_eq!(config.engine.max_node_visits, 8);
    assert_eq!(config.engine.step_timeout_secs, 120);
    assert_eq!(config.engine.event_buffer, 512);
    assert_eq!(config.generator.graph_file.as_deref(), Some("/tmp/generated-graph.json"));
    assert_eq!(config.generator.objective, "checkout");
    assert!(!config.log.enabled);
    assert_eq!(config.log.level, 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("QAFLOW_TEST_WORKSPACE", "/srv/qa-runs");

    let toml_content = r#"
[workspace]
dir = "${QAFLOW_TEST_WORKSPACE}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.workspace.dir, "/srv/qa-runs");
    assert_eq!(config.results_root(), PathBuf::from("/srv/qa-runs/results"));

    std::env::remove_var("QAFLOW_TEST_WORKSPACE");
}

#[test]
fn test_env_fallback_in_config() {
    std::env::remove_var("QAFLOW_TEST_UNSET_GRAPH");

    let toml_content = r#"
[generator]
graph_file = "${QAFLOW_TEST_UNSET_GRAPH:-demos/signup-graph.json}"
objective = "${QAFLOW_TEST_UNSET_OBJECTIVE}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.generator.graph_file.as_deref(), Some("demos/signup-graph.json"));
    // No fallback: left as written
    assert_eq!(config.generator.objective, "${QAFLOW_TEST_UNSET_OBJECTIVE}");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[registry]\nmax_active = 10\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.registry.max_active, 10);
    assert_eq!(config.registry.max_age_days, 7);
    assert_eq!(config.engine.max_node_visits, 5);
    assert_eq!(config.engine.step_timeout_secs, 0);
    assert!(config.generator.graph_file.is_none());
    assert!(config.log.enabled);
    assert_eq!(config.log.level, 2);
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_node_visits = 0\n").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, QaflowError::Config(_)));
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/qaflow.toml")).unwrap_err();
    assert!(matches!(err, QaflowError::ConfigNotFound(_)));

    let config = AppConfig::load_or_default(std::path::Path::new("/nonexistent/qaflow.toml"))
        .expect("defaults");
    assert_eq!(config.workspace.dir, "~/.qaflow");
}
