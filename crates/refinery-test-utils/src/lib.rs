//! Scripted delegates, recording sinks, and config fixtures shared by the
//! Refinery test suites.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use refinery_core::config::{EngineConfig, RetryConfig};
use refinery_core::error::DelegateError;
use refinery_core::traits::{AgentDelegate, TelemetrySink};
use refinery_core::types::{Capability, StageRequest, StageValue, TelemetryEvent};

type Script = dyn Fn(&StageRequest, u32) -> Result<StageValue, DelegateError> + Send + Sync;

/// A delegate driven by a closure.
///
/// The closure receives the request and the number of earlier calls made
/// for the same stage, so scripts can change answers between iterations.
pub struct ScriptedDelegate {
    name: String,
    script: Box<Script>,
    calls: Mutex<Vec<StageRequest>>,
    healthy: bool,
    hang: bool,
    delay: Option<Duration>,
}

impl ScriptedDelegate {
    pub fn new<F>(name: impl Into<String>, script: F) -> Self
    where
        F: Fn(&StageRequest, u32) -> Result<StageValue, DelegateError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            healthy: true,
            hang: false,
            delay: None,
        }
    }

    /// Answers every stage with `"<stage> v<call>"`.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, |req, call| Ok(json!(format!("{} v{}", req.stage, call))))
    }

    /// Echoes every stage except evaluation, which replays `evaluations`
    /// in order and then repeats the last one.
    pub fn with_evaluations(name: impl Into<String>, evaluations: Vec<StageValue>) -> Self {
        Self::new(name, move |req, call| {
            if req.capability == Capability::Evaluate {
                let idx = (call as usize).min(evaluations.len().saturating_sub(1));
                return evaluations
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| DelegateError::InvalidOutput("no evaluation scripted".into()));
            }
            Ok(json!(format!("{} v{}", req.stage, call)))
        })
    }

    /// Never answers.
    pub fn hanging(name: impl Into<String>) -> Self {
        let mut delegate = Self::echo(name);
        delegate.hang = true;
        delegate
    }

    /// Always fails with `err`.
    pub fn failing(name: impl Into<String>, err: DelegateError) -> Self {
        Self::new(name, move |_, _| Err(err.clone()))
    }

    /// Report unhealthy from `health()`.
    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received, in order.
    pub fn calls(&self) -> Vec<StageRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl AgentDelegate for ScriptedDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, request: StageRequest) -> BoxFuture<'_, Result<StageValue, DelegateError>> {
        Box::pin(async move {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let prior = calls.iter().filter(|r| r.stage == request.stage).count() as u32;
                calls.push(request.clone());
                prior
            };
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.script)(&request, call)
        })
    }

    fn health(&self) -> BoxFuture<'_, Result<(), DelegateError>> {
        let healthy = self.healthy;
        let name = self.name.clone();
        Box::pin(async move {
            if healthy {
                Ok(())
            } else {
                Err(DelegateError::Unavailable(format!("{} is down", name)))
            }
        })
    }
}

/// Telemetry sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count<F: Fn(&TelemetryEvent) -> bool>(&self, pred: F) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl TelemetrySink for RecordingSink {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Engine config with millisecond backoffs, for tests.
pub fn fast_engine_config(max_iterations: u32) -> EngineConfig {
    EngineConfig {
        max_iterations,
        stage_timeout_secs: 5,
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..Default::default()
    }
}

/// Evaluation the structured policy reads as "refine".
pub fn failing_evaluation() -> StageValue {
    json!({"passed": false, "issues": ["negative input not handled"]})
}

/// Evaluation the structured policy reads as clean.
pub fn passing_evaluation() -> StageValue {
    json!({"passed": true, "issues": []})
}
