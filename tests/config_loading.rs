use std::io::Write;

use refinery_core::config::{AppConfig, DelegateConfig, PolicyKind};
use refinery_core::types::Capability;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_iterations = 3
stage_timeout_secs = 120
rerun_test_creation = true

[engine.retry]
max_retries = 5
initial_backoff_ms = 250
max_backoff_ms = 4000

[engine.policy]
kind = "marker"
markers = ["needs refinement", "tests failing"]

[delegate]
type = "http"
base_url = "http://agents.internal:8700"
api_key = "rk_test"

[delegates.run_tests]
type = "command"
program = "python3"
args = ["run_tests.py"]
working_dir = "/srv/repo"

[delegates.run_tests.env]
PYTHONUNBUFFERED = "1"

[delegates.finalize]
type = "static"
output = "report skipped"

[log]
log_dir = "/tmp/refinery-logs"
level = 1

[export]
out_dir = "/tmp/refinery-runs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(toml_content.as_bytes()).unwrap();

    let config = AppConfig::load(tmp.path()).unwrap();

    assert_eq!(config.engine.max_iterations, 3);
    assert_eq!(config.engine.stage_timeout_secs, 120);
    assert!(config.engine.rerun_test_creation);
    assert_eq!(config.engine.retry.max_retries, 5);
    assert_eq!(config.engine.retry.initial_backoff_ms, 250);
    assert_eq!(config.engine.policy.kind, PolicyKind::Marker);
    assert_eq!(config.engine.policy.markers[1], "tests failing");

    match config.delegate_for(Capability::Design) {
        DelegateConfig::Http {
            base_url, api_key, ..
        } => {
            assert_eq!(base_url, "http://agents.internal:8700");
            assert_eq!(api_key.as_deref(), Some("rk_test"));
        }
        other => panic!("expected http delegate, got {:?}", other),
    }
    match config.delegate_for(Capability::RunTests) {
        DelegateConfig::Command {
            program,
            working_dir,
            env,
            ..
        } => {
            assert_eq!(program, "python3");
            assert_eq!(working_dir.as_deref(), Some("/srv/repo"));
            assert_eq!(env["PYTHONUNBUFFERED"], "1");
        }
        other => panic!("expected command delegate, got {:?}", other),
    }
    assert!(matches!(
        config.delegate_for(Capability::Finalize),
        DelegateConfig::Static { output: Some(_) }
    ));

    let log = config.log.unwrap();
    assert!(log.enabled);
    assert_eq!(log.level, 1);
    assert_eq!(log.dir().to_str(), Some("/tmp/refinery-logs"));
    assert_eq!(config.export.unwrap().out_dir, "/tmp/refinery-runs");
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("REFINERY_TEST_AGENT_KEY", "sk-from-env");
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(
        br#"
[delegate]
type = "http"
base_url = "http://localhost:8700"
api_key = "${REFINERY_TEST_AGENT_KEY}"
"#,
    )
    .unwrap();

    let config = AppConfig::load(tmp.path()).unwrap();
    std::env::remove_var("REFINERY_TEST_AGENT_KEY");

    match config.delegate {
        DelegateConfig::Http { api_key, .. } => {
            assert_eq!(api_key.as_deref(), Some("sk-from-env"));
        }
        other => panic!("expected http delegate, got {:?}", other),
    }
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[engine]\nmax_iterations = 2\n").unwrap();

    let config = AppConfig::load(tmp.path()).unwrap();
    assert_eq!(config.engine.max_iterations, 2);
    assert_eq!(config.engine.stage_timeout_secs, 300);
    assert!(config.log.is_none());
    assert!(config.export.is_none());
    assert!(config.delegates.is_empty());
}

#[test]
fn test_malformed_config_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[engine\nmax_iterations = ").unwrap();

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(err.to_string().starts_with("Config error"));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::parse(
        r#"
[delegate]
type = "command"
program = "agent"

[log]
"#,
    )
    .unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = AppConfig::parse(&rendered).unwrap();
    assert!(matches!(reparsed.delegate, DelegateConfig::Command { .. }));
    assert!(reparsed.log.is_some());
}
