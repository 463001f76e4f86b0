use std::io::Write;
use std::time::Duration;

use stepflow_core::config::AppConfig;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
workspace = "/tmp/stepflow-test"
step_timeout_secs = 45
event_bus_capacity = 64

[hitl]
approval_timeout_secs = 900

[audit]
enabled = false
dir = "/tmp/stepflow-audit"

[scheduler]
enabled = true

[agents.summarizer]
url = "http://localhost:8081/invoke"
capabilities = ["gpt-4", "search"]
timeout_secs = 30
api_key = "sk-test-key"

[agents.reviewer]
url = "http://localhost:8082/invoke"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.workspace, "/tmp/stepflow-test");
    assert_eq!(config.engine.event_bus_capacity, 64);
    assert_eq!(config.hitl.approval_timeout(), Duration::from_secs(900));
    assert!(!config.audit.enabled);
    assert_eq!(config.audit_dir().to_str(), Some("/tmp/stepflow-audit"));
    assert!(config.scheduler.enabled);
    assert_eq!(
        config.database_path().to_str(),
        Some("/tmp/stepflow-test/stepflow.db")
    );

    assert_eq!(config.agents.len(), 2);
    let summarizer = &config.agents["summarizer"];
    assert_eq!(summarizer.capabilities, vec!["gpt-4", "search"]);
    assert_eq!(summarizer.timeout_secs, Some(30));
    assert_eq!(summarizer.api_key, Some("sk-test-key".to_string()));
    let reviewer = &config.agents["reviewer"];
    // no request timeout unless configured
    assert_eq!(reviewer.timeout_secs, None);
    assert!(reviewer.api_key.is_none());
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPFLOW_TEST_AGENT_KEY", "expanded-key-value");

    let toml_content = r#"
[agents.scorer]
url = "http://localhost:9000"
api_key = "${STEPFLOW_TEST_AGENT_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.agents["scorer"].api_key,
        Some("expanded-key-value".to_string())
    );

    std::env::remove_var("STEPFLOW_TEST_AGENT_KEY");
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.workspace, "~/.stepflow");
    assert_eq!(config.engine.default_step_timeout_secs, 300);
    assert!(config.engine.step_timeout_secs.is_none());
    assert_eq!(config.hitl.approval_timeout_secs, 3600);
    assert!(config.audit.enabled);
    assert!(!config.scheduler.enabled);
    assert!(config.agents.is_empty());
}

#[test]
fn test_step_timeout_resolution() {
    let mut config = AppConfig::default();

    // derived from the workflow's expected duration
    assert_eq!(config.engine.step_timeout(10), Duration::from_secs(600));
    // unknown duration falls back to the default
    assert_eq!(config.engine.step_timeout(0), Duration::from_secs(300));

    config.engine.step_timeout_secs = Some(20);
    assert_eq!(config.engine.step_timeout(10), Duration::from_secs(20));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/stepflow.toml")).unwrap_err();
    assert!(matches!(
        err,
        stepflow_core::error::StepflowError::ConfigNotFound(_)
    ));
}

#[test]
fn test_malformed_config_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nworkspace = 3").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, stepflow_core::error::StepflowError::Config(_)));
}
