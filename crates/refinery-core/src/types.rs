use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;

/// Value stored under a context key: plain text or a structured record.
pub type StageValue = serde_json::Value;

/// Owner name recorded for the seeded task fields.
pub const TASK_OWNER: &str = "task";

/// Context keys seeded from the task before any stage runs.
pub const TASK_KEYS: [&str; 4] = ["description", "requirements", "language", "repo_path"];

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The caller's request. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_repo_path")]
    pub repo_path: String,
}

fn default_language() -> String { "python".to_string() }
fn default_repo_path() -> String { ".".to_string() }

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            requirements: Vec::new(),
            language: default_language(),
            repo_path: default_repo_path(),
        }
    }

    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_repo_path(mut self, repo_path: impl Into<String>) -> Self {
        self.repo_path = repo_path.into();
        self
    }

    /// Task fields as context entries, in `TASK_KEYS` order.
    pub fn context_entries(&self) -> [(&'static str, StageValue); 4] {
        [
            ("description", StageValue::String(self.description.clone())),
            (
                "requirements",
                StageValue::Array(
                    self.requirements
                        .iter()
                        .map(|r| StageValue::String(r.clone()))
                        .collect(),
                ),
            ),
            ("language", StageValue::String(self.language.clone())),
            ("repo_path", StageValue::String(self.repo_path.clone())),
        ]
    }
}

/// What kind of work a stage asks its delegate to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Design,
    Implement,
    CreateTests,
    RunTests,
    Evaluate,
    Refine,
    Finalize,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Design,
        Capability::Implement,
        Capability::CreateTests,
        Capability::RunTests,
        Capability::Evaluate,
        Capability::Refine,
        Capability::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Design => "design",
            Capability::Implement => "implement",
            Capability::CreateTests => "create_tests",
            Capability::RunTests => "run_tests",
            Capability::Evaluate => "evaluate",
            Capability::Refine => "refine",
            Capability::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

/// A single delegate invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub run_id: RunId,
    pub stage: String,
    pub capability: Capability,
    pub iteration: u32,
    /// Declared input keys mapped to their current context values.
    pub inputs: BTreeMap<String, StageValue>,
    /// Budget the engine will enforce on this call.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Terminal status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Finalize completed after a clean evaluation.
    Succeeded,
    /// Refinement budget ran out without a clean evaluation; finalize still ran.
    PartialSuccess,
    /// A non-retryable error, or exhausted stage retries.
    Failed,
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::PartialSuccess)
    }
}

/// Engine phase. `Refining` is the tagged back-edge after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Running,
    Refining,
    Finalizing,
    Succeeded,
    Failed,
}

/// One completed stage execution in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub stage: String,
    pub key: String,
    pub value: StageValue,
    pub iteration: u32,
    /// Delegate invocations it took, including the successful one.
    pub attempts: u32,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Diagnosis attached to a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: String,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub class: ErrorClass,
    pub message: String,
}

/// Final, immutable snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub task: Task,
    /// Last written value for every declared stage output key.
    pub outputs: BTreeMap<String, StageValue>,
    /// Refinement passes performed.
    pub iterations: u32,
    pub status: RunStatus,
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl WorkflowResult {
    pub fn output(&self, key: &str) -> Option<&StageValue> {
        self.outputs.get(key)
    }

    /// Number of times `stage` completed during the run.
    pub fn executions_of(&self, stage: &str) -> usize {
        self.history.iter().filter(|h| h.stage == stage).count()
    }
}

/// Outcome of a single stage, as reported to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

/// Event delivered to telemetry sinks. Fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    RunStarted {
        run_id: RunId,
        description: String,
    },
    StageCompleted {
        run_id: RunId,
        stage: String,
        iteration: u32,
        duration_ms: u64,
        status: StageStatus,
    },
    StageRetry {
        run_id: RunId,
        stage: String,
        iteration: u32,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    RefinementStarted {
        run_id: RunId,
        iteration: u32,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        /// Last phase the run state machine reached.
        phase: RunPhase,
        iterations: u32,
        elapsed_ms: u64,
    },
}

impl TelemetryEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            TelemetryEvent::RunStarted { run_id, .. }
            | TelemetryEvent::StageCompleted { run_id, .. }
            | TelemetryEvent::StageRetry { run_id, .. }
            | TelemetryEvent::RefinementStarted { run_id, .. }
            | TelemetryEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}
