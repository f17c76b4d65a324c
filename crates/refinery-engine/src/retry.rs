use std::future::Future;
use std::time::Duration;

use tracing::warn;

use refinery_core::config::RetryConfig;
use refinery_core::error::DelegateError;

/// Exponential backoff for `attempt` (0-based), capped, with 0.8x-1.2x jitter.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Final outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, DelegateError>,
    /// Invocations made, including the first.
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails non-transiently, or the retry budget
/// is spent. `on_retry(attempt, backoff, error)` is called before each sleep.
pub async fn with_retries<T, F, Fut, R>(
    config: &RetryConfig,
    mut on_retry: R,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DelegateError>>,
    R: FnMut(u32, Duration, &DelegateError),
{
    let max_retries = config.max_retries;
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                }
            }
            Err(e) if e.is_transient() && attempt < max_retries => {
                let backoff = backoff_delay(attempt, config);
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying delegate call"
                );
                on_retry(attempt + 1, backoff, &e);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                return RetryOutcome {
                    result: Err(e),
                    attempts: attempt + 1,
                }
            }
        }
    }
}
