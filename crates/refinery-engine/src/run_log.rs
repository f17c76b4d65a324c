use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use refinery_core::config::LogConfig;
use refinery_core::event::EventBus;
use refinery_core::types::{RunId, TelemetryEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the run log.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a TelemetryEvent,
}

impl RunLogger {
    /// `level`: 1 = run summary, 2 = + per-stage events.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(config.dir(), config.level)
    }

    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Subscribe now and log in a background task until the bus closes or
    /// `cancel` fires.
    pub fn start(self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, cancel, false))
    }

    /// Like `start`, but the task also ends once every run it has seen has
    /// finished. For a caller that drives a single run and then awaits the
    /// handle.
    pub fn start_for_one_run(self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, cancel, true))
    }

    async fn run(
        self,
        mut rx: Receiver<TelemetryEvent>,
        cancel: CancellationToken,
        stop_when_idle: bool,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(path = %self.log_dir.display(), "RunLogger started");

        let mut open: HashMap<RunId, BufWriter<File>> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            };

            let run_id = event.run_id().clone();
            if !open.contains_key(&run_id) {
                match open_log(&self.log_path(&run_id)).await {
                    Ok(writer) => {
                        open.insert(run_id.clone(), writer);
                    }
                    Err(e) => {
                        error!(error = %e, run_id = %run_id, "Failed to open log file");
                        continue;
                    }
                }
            }

            if self.accepts(&event) {
                if let Some(writer) = open.get_mut(&run_id) {
                    if let Err(e) = write_entry(writer, &event).await {
                        error!(error = %e, run_id = %run_id, "Failed to write log entry");
                    }
                }
            }

            if matches!(event, TelemetryEvent::RunFinished { .. }) {
                if let Some(mut writer) = open.remove(&run_id) {
                    writer.flush().await.ok();
                }
                if stop_when_idle && open.is_empty() {
                    break;
                }
            }
        }

        for (_, mut writer) in open {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    fn accepts(&self, event: &TelemetryEvent) -> bool {
        match event {
            TelemetryEvent::RunStarted { .. }
            | TelemetryEvent::RefinementStarted { .. }
            | TelemetryEvent::RunFinished { .. } => true,
            TelemetryEvent::StageCompleted { .. } | TelemetryEvent::StageRetry { .. } => {
                self.level >= 2
            }
        }
    }
}

async fn open_log(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

async fn write_entry(writer: &mut BufWriter<File>, event: &TelemetryEvent) -> std::io::Result<()> {
    let entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        event,
    };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
