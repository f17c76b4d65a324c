use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use refinery_core::error::DelegateError;
use refinery_core::traits::AgentDelegate;
use refinery_core::types::{StageRequest, StageValue};

/// Exit code a program uses to ask for a retry (EX_TEMPFAIL).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Delegate that runs a local program per stage.
///
/// The request is written to stdin as JSON. Stdout is the stage output:
/// parsed as JSON when it is JSON, otherwise kept as text. The child is
/// killed if the call is dropped (timeout or cancellation).
pub struct CommandDelegate {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandDelegate {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: Option<impl Into<PathBuf>>) -> Self {
        self.working_dir = dir.map(Into::into);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    async fn run(&self, request: StageRequest) -> Result<StageValue, DelegateError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| DelegateError::Rejected(format!("cannot encode request: {}", e)))?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            DelegateError::Unavailable(format!("failed to start '{}': {}", self.program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program may ignore its input and exit early.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(program = %self.program, error = %e, "Could not write request to stdin");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DelegateError::Connection(format!("waiting for '{}': {}", self.program, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(parse_output(&String::from_utf8_lossy(&output.stdout))),
            Some(EXIT_TEMPFAIL) => Err(DelegateError::Connection(format!(
                "'{}' asked for retry: {}",
                self.program, stderr
            ))),
            Some(code) => Err(DelegateError::Rejected(format!(
                "'{}' exited with {}: {}",
                self.program, code, stderr
            ))),
            None => Err(DelegateError::Rejected(format!(
                "'{}' terminated by signal",
                self.program
            ))),
        }
    }
}

/// JSON stdout becomes a record; anything else is text.
fn parse_output(stdout: &str) -> StageValue {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| StageValue::String(trimmed.to_string()))
}

impl AgentDelegate for CommandDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, request: StageRequest) -> BoxFuture<'_, Result<StageValue, DelegateError>> {
        Box::pin(self.run(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use refinery_core::types::{Capability, RunId};
    use serde_json::json;

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("{\"passed\": true}\n"), json!({"passed": true}));
        assert_eq!(parse_output("  def fib(n): ...\n"), json!("def fib(n): ..."));
        assert_eq!(parse_output(""), json!(""));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn request() -> StageRequest {
            let mut inputs = BTreeMap::new();
            inputs.insert("description".to_string(), json!("calc fibonacci"));
            StageRequest {
                run_id: RunId::from_string("run-cmd"),
                stage: "design".into(),
                capability: Capability::Design,
                iteration: 0,
                inputs,
                timeout: Duration::from_secs(5),
            }
        }

        fn sh(script: &str) -> CommandDelegate {
            CommandDelegate::new("sh", "sh").with_args(vec!["-c".into(), script.into()])
        }

        #[tokio::test]
        async fn test_request_on_stdin() {
            let value = sh("cat").invoke(request()).await.unwrap();
            assert_eq!(value["stage"], "design");
            assert_eq!(value["inputs"]["description"], "calc fibonacci");
            assert_eq!(value["timeout"], 5000);
        }

        #[tokio::test]
        async fn test_text_output() {
            let value = sh("echo plan ready").invoke(request()).await.unwrap();
            assert_eq!(value, json!("plan ready"));
        }

        #[tokio::test]
        async fn test_env_and_working_dir() {
            let dir = std::env::temp_dir();
            let mut env = HashMap::new();
            env.insert("REFINERY_STAGE_HINT".to_string(), "hint".to_string());
            let delegate = sh("echo $REFINERY_STAGE_HINT")
                .with_env(env)
                .with_working_dir(Some(dir));
            assert_eq!(delegate.invoke(request()).await.unwrap(), json!("hint"));
        }

        #[tokio::test]
        async fn test_tempfail_is_transient() {
            let err = sh("echo busy >&2; exit 75").invoke(request()).await.unwrap_err();
            assert!(err.is_transient());
            assert!(err.to_string().contains("busy"));
        }

        #[tokio::test]
        async fn test_failure_is_rejected() {
            let err = sh("echo nope >&2; exit 2").invoke(request()).await.unwrap_err();
            assert!(matches!(err, DelegateError::Rejected(ref m) if m.contains("nope")));
        }

        #[tokio::test]
        async fn test_missing_program() {
            let err = CommandDelegate::new("ghost", "/nonexistent/refinery-agent")
                .invoke(request())
                .await
                .unwrap_err();
            assert!(matches!(err, DelegateError::Unavailable(_)));
        }
    }
}
