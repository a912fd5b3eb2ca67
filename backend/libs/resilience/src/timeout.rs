/// Deadline wrapper for calls into external stores
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Operation timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

/// Execute a future with a deadline.
///
/// A zero duration disables the deadline.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    if duration.is_zero() {
        return Ok(future.await);
    }

    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError(duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = with_timeout(Duration::from_millis(100), async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_elapsed() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await;
        assert_eq!(result, Err(TimeoutError(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_zero_disables_deadline() {
        let result = with_timeout(Duration::ZERO, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            "done"
        })
        .await;
        assert_eq!(result, Ok("done"));
    }
}
