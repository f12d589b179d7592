// Retry utilities: exponential backoff shared by the worker pool and startup

use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Delay before the next attempt after `attempts` failed executions:
/// `base * 2^(attempts - 1)`.
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

pub async fn with_retry<F, T, E>(
    mut operation: F,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> futures::future::BoxFuture<'static, Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(error);
                }

                let delay = backoff_delay(base_delay, attempt);
                warn!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %error, "Operation failed, retrying");
                sleep(delay).await;
            }
        }
    }
}
