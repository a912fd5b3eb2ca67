/// Retry policy with exponential backoff and jitter
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first call
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single backoff
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after `failed_attempts` consecutive failures, before jitter.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// The operation failed with an error that must not be retried
    #[error("Non-retryable failure: {0}")]
    Permanent(E),
}

/// Execute an operation, retrying only while `is_transient` holds for its error.
///
/// The closure receives the 1-based attempt number. Sleeping happens on the
/// calling task only.
pub async fn with_transient_retry<F, Fut, T, E, P>(
    config: &RetryConfig,
    is_transient: P,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if !is_transient(&e) => return Err(RetryError::Permanent(e)),
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        attempts = attempt,
                        error = %e,
                        "Retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }

                let delay = calculate_backoff(config, attempt);

                warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Execute an operation, treating every error as transient
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    with_transient_retry(config, |_| true, |_| f()).await
}

/// Jittered backoff, never above `max_backoff`
fn calculate_backoff(config: &RetryConfig, failed_attempts: u32) -> Duration {
    let base = config.backoff_for(failed_attempts);
    if config.jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3);
        let jittered = Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64);
        jittered.min(config.max_backoff)
    } else {
        base
    }
}
