/// Resilience patterns for the CDC pipeline
///
/// - **Retry**: bounded exponential backoff with jitter, retrying only the
///   failures a caller classifies as transient
/// - **Timeout**: time limits on calls into external stores
///
/// # Example: retry a sink write until it stops failing transiently
///
/// ```rust,no_run
/// use resilience::{with_transient_retry, RetryConfig};
///
/// #[derive(Debug)]
/// enum WriteError { Connection, Constraint }
///
/// impl std::fmt::Display for WriteError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "{:?}", self)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let config = RetryConfig::default();
///     let result = with_transient_retry(
///         &config,
///         |e: &WriteError| matches!(e, WriteError::Connection),
///         |_attempt| async { Ok::<_, WriteError>(()) },
///     )
///     .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod retry;
pub mod timeout;

pub use retry::{with_retry, with_transient_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout, TimeoutError};
