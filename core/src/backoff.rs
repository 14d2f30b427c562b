use crate::Error;
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

fn create_backoff(max_retries: u32, base_delay_ms: u64) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: Duration::from_millis(base_delay_ms),
        initial_interval: Duration::from_millis(base_delay_ms),
        randomization_factor: 0.5,
        multiplier: 2.0,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: Some(Duration::from_secs(max_retries as u64 * 30)),
        ..ExponentialBackoff::default()
    }
}

/// Retries `operation` with jittered exponential backoff. Only transient
/// failures are retried; a classified error already carries a definite
/// answer and is returned immediately. Used around sink writes so that a
/// transient I/O hiccup does not lose a forwarded record.
pub async fn retry_with_backoff<F, Fut, T>(
    operation: F,
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut backoff = create_backoff(max_retries, base_delay_ms);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "Succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                warn!(operation = operation_name, error = %e, "Non-retryable error, giving up");
                return Err(e);
            }
            Err(e) if attempts >= max_retries => {
                warn!(
                    operation = operation_name,
                    attempts,
                    error = %e,
                    "Failed after max retries"
                );
                return Err(e);
            }
            Err(e) => match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        retry_after_ms = delay.as_millis(),
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(operation = operation_name, attempts, error = %e, "Backoff exhausted");
                    return Err(e);
                }
            },
        }
    }
}
