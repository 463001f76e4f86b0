use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};

/// Top-level stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Agent endpoints keyed by the `agentRef` steps use.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Fixed per-step agent timeout. Overrides the expected-duration default.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    /// Used when neither an override nor an expected duration is set.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            step_timeout_secs: None,
            default_step_timeout_secs: default_step_timeout_secs(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl EngineConfig {
    /// Agent invocation timeout for a workflow with the given expected
    /// duration in minutes.
    pub fn step_timeout(&self, expected_duration_mins: u32) -> Duration {
        let secs = match self.step_timeout_secs {
            Some(secs) => secs,
            None if expected_duration_mins > 0 => u64::from(expected_duration_mins) * 60,
            None => self.default_step_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    /// Undecided checkpoints are rejected after this long.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl HitlConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Defaults to `{workspace}/audit`.
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// An HTTP agent endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Per-request HTTP timeout. Unset leaves the step timeout in charge.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_workspace() -> String { "~/.stepflow".to_string() }
fn default_step_timeout_secs() -> u64 { 300 }
fn default_event_bus_capacity() -> usize { 256 }
fn default_approval_timeout_secs() -> u64 { 3600 }
fn default_audit_enabled() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))
    }

    /// `./stepflow.toml` if present, else `~/.stepflow/config.toml`.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from("stepflow.toml");
        if local.exists() {
            return local;
        }
        match dirs_home() {
            Some(home) => home.join(".stepflow").join("config.toml"),
            None => local,
        }
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn database_path(&self) -> PathBuf {
        self.workspace_dir().join("stepflow.db")
    }

    pub fn audit_dir(&self) -> PathBuf {
        match &self.audit.dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("audit"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // left as written when unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.workspace, "~/.stepflow");
        assert_eq!(config.engine.default_step_timeout_secs, 300);
        assert_eq!(config.hitl.approval_timeout_secs, 3600);
        assert!(config.audit.enabled);
        assert!(!config.scheduler.enabled);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_step_timeout_resolution() {
        let mut engine = EngineConfig::default();
        assert_eq!(engine.step_timeout(0), Duration::from_secs(300));
        assert_eq!(engine.step_timeout(2), Duration::from_secs(120));
        engine.step_timeout_secs = Some(5);
        assert_eq!(engine.step_timeout(2), Duration::from_secs(5));
    }

    #[test]
    fn test_agents_section() {
        let toml_str = r#"
[engine]
workspace = "/tmp/sf"

[audit]
dir = "/var/log/stepflow"

[agents.scorer]
url = "http://localhost:9000/invoke"
capabilities = ["nlp", "ocr"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let scorer = &config.agents["scorer"];
        assert_eq!(scorer.timeout_secs, None);
        assert_eq!(scorer.capabilities, vec!["nlp", "ocr"]);
        assert!(scorer.api_key.is_none());
        assert_eq!(config.database_path(), PathBuf::from("/tmp/sf/stepflow.db"));
        assert_eq!(config.audit_dir(), PathBuf::from("/var/log/stepflow"));
    }

    #[test]
    fn test_load_expands_env() {
        use std::io::Write;

        std::env::set_var("TEST_STEPFLOW_KEY", "sk-123");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[agents.reader]\nurl = \"http://reader\"\napi_key = \"${{TEST_STEPFLOW_KEY}}\""
        )
        .unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.agents["reader"].api_key.as_deref(), Some("sk-123"));
        std::env::remove_var("TEST_STEPFLOW_KEY");
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/stepflow.toml")).unwrap_err();
        assert!(matches!(err, StepflowError::ConfigNotFound(_)));
    }
}
