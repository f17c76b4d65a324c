use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RefineryError};
use crate::types::Capability;

/// Top-level Refinery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Delegate used for every capability without an override.
    #[serde(default)]
    pub delegate: DelegateConfig,
    /// Per-capability delegate overrides, keyed by capability name.
    #[serde(default)]
    pub delegates: HashMap<String, DelegateConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub export: Option<ExportConfig>,
    /// Custom stage graph. The built-in dev pipeline is used when absent.
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
}

/// Engine behaviour: refinement bound, stage timeouts, retries, policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum refinement passes after the first evaluation.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Per-invocation budget for a delegate call.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    /// Re-run test creation stages on refinement passes.
    #[serde(default)]
    pub rerun_test_creation: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stage_timeout_secs: default_stage_timeout(),
            rerun_test_creation: false,
            retry: RetryConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

fn default_max_iterations() -> u32 { 1 }
fn default_stage_timeout() -> u64 { 300 }

/// Retry configuration for transient stage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Which refinement policy to apply to the evaluation output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Interpret a structured evaluation record, falling back to markers.
    #[default]
    Structured,
    /// Plain case-insensitive marker matching.
    Marker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub kind: PolicyKind,
    /// Phrases that flag an evaluation as needing refinement.
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::default(),
            markers: default_markers(),
        }
    }
}

fn default_markers() -> Vec<String> {
    vec!["needs refinement".to_string(), "issues found".to_string()]
}

/// How to reach the agent that performs a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelegateConfig {
    /// Agent service speaking the `/invoke` + `/health` JSON protocol.
    Http {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
    /// Local program: request JSON on stdin, output on stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Canned output, for dry runs.
    Static {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
}

impl Default for DelegateConfig {
    fn default() -> Self {
        DelegateConfig::Static { output: None }
    }
}

fn default_connect_timeout() -> u64 { 10 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary, 2 = + stage completions and retries.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(self.log_dir.as_deref().unwrap_or("logs"))
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Where finished runs are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
        }
    }
}

fn default_out_dir() -> String { ".refinery/runs".to_string() }

/// Serialized form of a stage graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageConfig>,
    /// Name of the stage whose output drives the refinement decision.
    pub evaluate: String,
    /// Name of the stage the back-edge re-enters.
    pub refine_target: String,
    /// Stage that stands in for the refine target on refinement passes.
    #[serde(default)]
    pub refiner: Option<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub capability: Capability,
    #[serde(default)]
    pub input_keys: Vec<String>,
    pub output_key: String,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RefineryError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| RefineryError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Delegate configuration for a capability (override, else the default).
    pub fn delegate_for(&self, capability: Capability) -> &DelegateConfig {
        self.delegates
            .get(capability.as_str())
            .unwrap_or(&self.delegate)
    }

    fn check(&self) -> Result<()> {
        for name in self.delegates.keys() {
            name.parse::<Capability>().map_err(|e| {
                RefineryError::Config(format!("[delegates.{}]: {}", name, e))
            })?;
        }
        if self.engine.stage_timeout_secs == 0 {
            return Err(RefineryError::Config(
                "engine.stage_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_REFINERY_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_REFINERY_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_REFINERY_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_REFINERY_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_REFINERY_VAR}\"");
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.engine.max_iterations, 1);
        assert_eq!(config.engine.stage_timeout(), Duration::from_secs(300));
        assert!(!config.engine.rerun_test_creation);
        assert_eq!(config.engine.retry.max_retries, 3);
        assert_eq!(config.engine.policy.kind, PolicyKind::Structured);
        assert_eq!(config.engine.policy.markers.len(), 2);
        assert!(matches!(config.delegate, DelegateConfig::Static { output: None }));
        assert!(config.pipeline.is_none());
    }

    #[test]
    fn test_delegate_overrides() {
        let config = AppConfig::parse(
            r#"
[delegate]
type = "http"
base_url = "http://localhost:8900"

[delegates.run_tests]
type = "command"
program = "pytest"
args = ["-q"]
"#,
        )
        .unwrap();

        assert!(matches!(
            config.delegate_for(Capability::Design),
            DelegateConfig::Http { connect_timeout_secs: 10, .. }
        ));
        match config.delegate_for(Capability::RunTests) {
            DelegateConfig::Command { program, args, .. } => {
                assert_eq!(program, "pytest");
                assert_eq!(args, &vec!["-q".to_string()]);
            }
            other => panic!("unexpected delegate: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_capability_override_rejected() {
        let err = AppConfig::parse(
            r#"
[delegates.deploy]
type = "static"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RefineryError::Config(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = AppConfig::parse("[engine]\nstage_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("stage_timeout_secs"));
    }

    #[test]
    fn test_pipeline_section() {
        let config = AppConfig::parse(
            r#"
[pipeline]
evaluate = "review"
refine_target = "code"

[[pipeline.stages]]
name = "code"
capability = "implement"
input_keys = ["description"]
output_key = "code"

[[pipeline.stages]]
name = "review"
capability = "evaluate"
input_keys = ["code"]
output_key = "review"
"#,
        )
        .unwrap();

        let pipeline = config.pipeline.unwrap();
        assert_eq!(pipeline.stages.len(), 2);
        assert_eq!(pipeline.stages[0].capability, Capability::Implement);
        assert!(pipeline.refiner.is_none());
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/refinery.toml")).unwrap_err();
        assert!(matches!(err, RefineryError::ConfigNotFound(_)));
    }
}
