use futures::future::BoxFuture;

use crate::error::{DelegateError, Result};
use crate::types::*;

/// Agent delegate: performs the actual work of a stage.
///
/// Implementations must tolerate being invoked more than once for the same
/// request: the engine retries transient failures.
pub trait AgentDelegate: Send + Sync + 'static {
    /// Delegate name (used in logs).
    fn name(&self) -> &str;

    /// Execute one stage request and return its output value.
    fn invoke(&self, request: StageRequest) -> BoxFuture<'_, std::result::Result<StageValue, DelegateError>>;

    /// Report whether the backing agent endpoint can accept work.
    fn health(&self) -> BoxFuture<'_, std::result::Result<(), DelegateError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Telemetry sink: receives run and stage events.
///
/// Must not block and cannot fail the run.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, event: TelemetryEvent);
}

/// Output exporter: materializes a finished run (files, commits, ...).
pub trait OutputExporter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn export<'a>(&'a self, result: &'a WorkflowResult) -> BoxFuture<'a, Result<()>>;
}
