use tracing::{debug, info, warn};

use refinery_core::traits::TelemetrySink;
use refinery_core::types::{StageStatus, TelemetryEvent};

/// Forwards telemetry events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::RunStarted {
                run_id,
                description,
            } => info!(run_id = %run_id, description = %description, "run started"),
            TelemetryEvent::StageCompleted {
                run_id,
                stage,
                iteration,
                duration_ms,
                status: StageStatus::Succeeded,
            } => info!(run_id = %run_id, stage = %stage, iteration, duration_ms, "stage completed"),
            TelemetryEvent::StageCompleted {
                run_id,
                stage,
                iteration,
                duration_ms,
                status: StageStatus::Failed,
            } => warn!(run_id = %run_id, stage = %stage, iteration, duration_ms, "stage failed"),
            TelemetryEvent::StageRetry {
                run_id,
                stage,
                attempt,
                backoff_ms,
                error,
                ..
            } => debug!(
                run_id = %run_id,
                stage = %stage,
                attempt,
                backoff_ms,
                error = %error,
                "stage retry"
            ),
            TelemetryEvent::RefinementStarted { run_id, iteration } => {
                info!(run_id = %run_id, iteration, "refinement started")
            }
            TelemetryEvent::RunFinished {
                run_id,
                status,
                phase,
                iterations,
                elapsed_ms,
            } => info!(
                run_id = %run_id,
                status = ?status,
                phase = ?phase,
                iterations,
                elapsed_ms,
                "run finished"
            ),
        }
    }
}
