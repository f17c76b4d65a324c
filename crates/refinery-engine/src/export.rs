use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use refinery_core::config::ExportConfig;
use refinery_core::error::Result;
use refinery_core::traits::OutputExporter;
use refinery_core::types::{RunId, StageValue, WorkflowResult};

/// One line of `history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub stage: String,
    pub key: String,
    pub value: StageValue,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

/// Writes `result.json` and `history.jsonl` under `{out_dir}/{run_id}/`.
#[derive(Debug, Clone)]
pub struct JsonFileExporter {
    out_dir: PathBuf,
}

impl JsonFileExporter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(&config.out_dir)
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.out_dir.join(&run_id.0)
    }

    async fn write(&self, result: &WorkflowResult) -> Result<()> {
        let dir = self.run_dir(&result.run_id);
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_string_pretty(result)?;
        tokio::fs::write(dir.join("result.json"), json).await?;

        let mut history = String::new();
        for entry in &result.history {
            let record = AuditRecord {
                stage: entry.stage.clone(),
                key: entry.key.clone(),
                value: entry.value.clone(),
                iteration: entry.iteration,
                timestamp: entry.timestamp,
            };
            history.push_str(&serde_json::to_string(&record)?);
            history.push('\n');
        }
        let mut file = tokio::fs::File::create(dir.join("history.jsonl")).await?;
        file.write_all(history.as_bytes()).await?;
        file.flush().await?;

        info!(run_id = %result.run_id, path = %dir.display(), "Exported run");
        Ok(())
    }
}

impl OutputExporter for JsonFileExporter {
    fn name(&self) -> &str {
        "json_file"
    }

    fn export<'a>(&'a self, result: &'a WorkflowResult) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(result))
    }
}

/// Hand a finished run to `exporter`, once, if it completed.
///
/// Returns whether the exporter was invoked.
pub async fn export_completed(exporter: &dyn OutputExporter, result: &WorkflowResult) -> Result<bool> {
    if !result.status.is_complete() {
        debug!(run_id = %result.run_id, status = ?result.status, "Skipping export of failed run");
        return Ok(false);
    }
    exporter.export(result).await?;
    Ok(true)
}

/// Read back a `history.jsonl` file.
pub fn read_history(path: &Path) -> Result<Vec<AuditRecord>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use refinery_core::types::{HistoryEntry, RunStatus, Task};
    use serde_json::json;

    fn result(status: RunStatus) -> WorkflowResult {
        let now = Utc::now();
        let history = vec![
            HistoryEntry {
                stage: "implement".into(),
                key: "implementation".into(),
                value: json!("def fib(n): ..."),
                iteration: 0,
                attempts: 1,
                duration_ms: 4,
                timestamp: now,
            },
            HistoryEntry {
                stage: "refine".into(),
                key: "implementation".into(),
                value: json!("def fib(n): handles n < 0"),
                iteration: 1,
                attempts: 2,
                duration_ms: 7,
                timestamp: now,
            },
        ];
        let mut outputs = BTreeMap::new();
        outputs.insert("implementation".to_string(), json!("def fib(n): handles n < 0"));
        WorkflowResult {
            run_id: RunId::from_string("run-export"),
            task: Task::new("calc fibonacci"),
            outputs,
            iterations: 1,
            status,
            history,
            failure: None,
            started_at: now,
            elapsed_ms: 11,
        }
    }

    struct CountingExporter(AtomicUsize);

    impl OutputExporter for CountingExporter {
        fn name(&self) -> &str {
            "counting"
        }

        fn export<'a>(&'a self, _result: &'a WorkflowResult) -> BoxFuture<'a, Result<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_writes_result_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonFileExporter::new(dir.path());
        let result = result(RunStatus::Succeeded);

        exporter.export(&result).await.unwrap();

        let run_dir = exporter.run_dir(&result.run_id);
        let saved: WorkflowResult =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("result.json")).unwrap())
                .unwrap();
        assert_eq!(saved.status, RunStatus::Succeeded);
        assert_eq!(saved.history.len(), 2);

        let records = read_history(&run_dir.join("history.jsonl")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].stage, "refine");
        assert_eq!(records[1].iteration, 1);
    }

    #[tokio::test]
    async fn test_export_completed_only() {
        let exporter = CountingExporter(AtomicUsize::new(0));

        assert!(export_completed(&exporter, &result(RunStatus::Succeeded)).await.unwrap());
        assert!(export_completed(&exporter, &result(RunStatus::PartialSuccess)).await.unwrap());
        assert!(!export_completed(&exporter, &result(RunStatus::Failed)).await.unwrap());
        assert_eq!(exporter.0.load(Ordering::SeqCst), 2);
    }
}
