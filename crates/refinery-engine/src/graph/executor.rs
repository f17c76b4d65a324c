use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use refinery_core::config::EngineConfig;
use refinery_core::error::{DelegateError, RefineryError, Result};
use refinery_core::traits::TelemetrySink;
use refinery_core::types::{
    HistoryEntry, RunFailure, RunId, RunPhase, RunStatus, StageRequest, StageStatus, StageValue,
    Task, TelemetryEvent, WorkflowResult,
};

use super::context::WorkflowContext;
use super::stage::Stage;
use super::state::RunState;
use super::workflow::WorkflowGraph;
use crate::delegates::DelegateSet;
use crate::policy::{self, RefinementPolicy};
use crate::retry::with_retries;

/// Drives tasks through a `WorkflowGraph`.
///
/// The engine itself is immutable; every run gets its own context and run
/// state, so one engine can serve concurrent runs.
pub struct WorkflowEngine {
    graph: WorkflowGraph,
    delegates: DelegateSet,
    config: EngineConfig,
    policy: Arc<dyn RefinementPolicy>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl WorkflowEngine {
    /// Create an engine. Fails if some stage has no delegate for its
    /// capability.
    pub fn new(graph: WorkflowGraph, delegates: DelegateSet, config: EngineConfig) -> Result<Self> {
        for capability in graph.capabilities() {
            delegates.require(capability)?;
        }
        let policy = policy::from_config(&config.policy);
        Ok(Self {
            graph,
            delegates,
            config,
            policy,
            sinks: Vec::new(),
        })
    }

    /// Replace the configured refinement policy.
    pub fn with_policy(mut self, policy: Arc<dyn RefinementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Add a telemetry sink.
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ask every delegate the graph needs whether it can accept work.
    pub async fn check_health(&self) -> Result<()> {
        for delegate in self.delegates.distinct(&self.graph.capabilities()) {
            if let Err(e) = delegate.health().await {
                warn!(delegate = %delegate.name(), error = %e, "Delegate reported unhealthy");
                return Err(RefineryError::Unavailable(format!("{}: {}", delegate.name(), e)));
            }
        }
        Ok(())
    }

    /// Run a task to completion.
    pub async fn run(&self, task: Task) -> Result<WorkflowResult> {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    /// Run a task, aborting when `cancel` fires.
    ///
    /// Startup problems (an unhealthy delegate) return `Err`. Anything that
    /// goes wrong once stages are executing is reported in the result with
    /// status `Failed`.
    pub async fn run_with_cancel(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult> {
        self.check_health().await?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(run_id = %run_id, stages = self.graph.stages().len(), "Starting workflow run");
        self.emit(TelemetryEvent::RunStarted {
            run_id: run_id.clone(),
            description: task.description.clone(),
        });

        let mut run = Run {
            engine: self,
            run_id: run_id.clone(),
            ctx: WorkflowContext::seeded(&task),
            state: RunState::new(self.config.max_iterations),
            cancel,
        };
        let outcome = run.drive().await;

        let (status, failure) = match outcome {
            Ok(status) => (status, None),
            Err(failure) => {
                run.enter(RunPhase::Failed);
                (RunStatus::Failed, Some(failure))
            }
        };

        let declared: HashSet<&str> = self.graph.output_keys().into_iter().collect();
        let outputs = run
            .ctx
            .snapshot()
            .into_inner()
            .into_iter()
            .filter(|(key, _)| declared.contains(key.as_str()))
            .collect();

        let iterations = run.state.iteration();
        let phase = run.state.phase();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            run_id = %run_id,
            status = ?status,
            iterations,
            elapsed_ms,
            "Workflow run finished"
        );
        self.emit(TelemetryEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            phase,
            iterations,
            elapsed_ms,
        });

        Ok(WorkflowResult {
            run_id,
            task,
            outputs,
            iterations,
            status,
            history: run.state.into_history(),
            failure,
            started_at,
            elapsed_ms,
        })
    }

    fn emit(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

/// One in-flight run.
struct Run<'e> {
    engine: &'e WorkflowEngine,
    run_id: RunId,
    ctx: WorkflowContext,
    state: RunState,
    cancel: CancellationToken,
}

impl Run<'_> {
    fn enter(&mut self, next: RunPhase) {
        let from = self.state.phase();
        if !self.state.transition(next) {
            warn!(run_id = %self.run_id, from = ?from, to = ?next, "Invalid run phase transition");
            debug_assert!(false, "invalid run phase transition {:?} -> {:?}", from, next);
        }
    }

    async fn drive(&mut self) -> std::result::Result<RunStatus, RunFailure> {
        let engine = self.engine;
        let graph = &engine.graph;
        self.enter(RunPhase::Running);

        for stage in graph.head() {
            self.execute_stage(stage, &stage.name).await?;
        }

        let evaluate = graph.evaluate_stage();
        let clean = loop {
            let evaluation = self
                .ctx
                .get(&evaluate.output_key)
                .map_err(|e| self.failure(evaluate, e))?;
            if !engine.policy.should_refine(evaluation) {
                break true;
            }
            let Some(iteration) = self.state.begin_refinement() else {
                warn!(
                    run_id = %self.run_id,
                    max_iterations = self.state.max_iterations(),
                    "Refinement budget exhausted without a clean evaluation"
                );
                break false;
            };

            info!(run_id = %self.run_id, iteration, "Starting refinement pass");
            engine.emit(TelemetryEvent::RefinementStarted {
                run_id: self.run_id.clone(),
                iteration,
            });

            let owner = &graph.refine_target().name;
            for stage in graph.refine_span(engine.config.rerun_test_creation) {
                let owner = match graph.refiner() {
                    Some(refiner) if std::ptr::eq(refiner, stage) => owner,
                    _ => &stage.name,
                };
                self.execute_stage(stage, owner).await?;
            }
            self.enter(RunPhase::Running);
        };

        self.enter(RunPhase::Finalizing);
        for stage in graph.tail() {
            self.execute_stage(stage, &stage.name).await?;
        }
        self.enter(RunPhase::Succeeded);

        Ok(if clean {
            RunStatus::Succeeded
        } else {
            RunStatus::PartialSuccess
        })
    }

    /// Run one stage and write its output on behalf of `owner`.
    async fn execute_stage(
        &mut self,
        stage: &Stage,
        owner: &str,
    ) -> std::result::Result<(), RunFailure> {
        let started = Instant::now();
        match self.try_execute_stage(stage, owner, started).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    run_id = %self.run_id,
                    stage = %stage.name,
                    iteration = self.state.iteration(),
                    class = %e.class(),
                    error = %e,
                    "Stage failed"
                );
                self.engine.emit(TelemetryEvent::StageCompleted {
                    run_id: self.run_id.clone(),
                    stage: stage.name.clone(),
                    iteration: self.state.iteration(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    status: StageStatus::Failed,
                });
                Err(self.failure(stage, e))
            }
        }
    }

    async fn try_execute_stage(&mut self, stage: &Stage, owner: &str, started: Instant) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RefineryError::Cancelled);
        }

        let engine = self.engine;
        let iteration = self.state.iteration();
        let delegate = Arc::clone(engine.delegates.require(stage.capability)?);
        let request = StageRequest {
            run_id: self.run_id.clone(),
            stage: stage.name.clone(),
            capability: stage.capability,
            iteration,
            inputs: self.ctx.gather(stage)?,
            timeout: engine.config.stage_timeout(),
        };

        debug!(
            run_id = %self.run_id,
            stage = %stage.name,
            delegate = %delegate.name(),
            iteration,
            "Executing stage"
        );

        let timeout = request.timeout;
        let run_id = &self.run_id;
        let attempts = with_retries(
            &engine.config.retry,
            |attempt, backoff, err: &DelegateError| {
                engine.emit(TelemetryEvent::StageRetry {
                    run_id: run_id.clone(),
                    stage: stage.name.clone(),
                    iteration,
                    attempt,
                    backoff_ms: backoff.as_millis() as u64,
                    error: err.to_string(),
                })
            },
            |_| {
                let request = request.clone();
                let delegate = Arc::clone(&delegate);
                async move {
                    match tokio::time::timeout(timeout, delegate.invoke(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(DelegateError::Timeout(timeout.as_millis() as u64)),
                    }
                }
            },
        );

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!(run_id = %self.run_id, stage = %stage.name, "Run cancelled");
                return Err(RefineryError::Cancelled);
            }
            outcome = attempts => outcome,
        };

        let value = outcome.result.map_err(|e| {
            RefineryError::from_delegate(&stage.name, &stage.output_key, outcome.attempts, e)
        })?;
        validate_output(stage, &value)?;

        self.ctx.set(owner, &stage.output_key, value.clone())?;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.state.record(HistoryEntry {
            stage: stage.name.clone(),
            key: stage.output_key.clone(),
            value,
            iteration,
            attempts: outcome.attempts,
            duration_ms,
            timestamp: Utc::now(),
        });

        debug!(
            run_id = %self.run_id,
            stage = %stage.name,
            iteration,
            attempts = outcome.attempts,
            duration_ms,
            "Stage complete"
        );
        engine.emit(TelemetryEvent::StageCompleted {
            run_id: self.run_id.clone(),
            stage: stage.name.clone(),
            iteration,
            duration_ms,
            status: StageStatus::Succeeded,
        });
        Ok(())
    }

    fn failure(&self, stage: &Stage, err: RefineryError) -> RunFailure {
        RunFailure {
            stage: stage.name.clone(),
            iteration: self.state.iteration(),
            key: Some(err.key().unwrap_or(&stage.output_key).to_string()),
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Null and blank text are not usable stage outputs.
fn validate_output(stage: &Stage, value: &StageValue) -> Result<()> {
    let problem = match value {
        StageValue::Null => Some("output is null"),
        StageValue::String(s) if s.trim().is_empty() => Some("output is empty"),
        _ => None,
    };
    match problem {
        Some(message) => Err(RefineryError::InvalidOutput {
            stage: stage.name.clone(),
            key: stage.output_key.clone(),
            message: message.to_string(),
        }),
        None => Ok(()),
    }
}
