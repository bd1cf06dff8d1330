//! Bounded retries around an asynchronous operation.
//!
//! [`retry`] runs an operation until it succeeds, fails with an error the
//! [`RetryConfig`] predicate rejects, runs out of attempts, or would have to
//! wait past the configured total timeout.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use reqwest::StatusCode;
use tokio::time::{sleep, Instant};

use crate::{
    backoff::{BackoffStrategy, NoBackoff},
    Error, Result,
};

type Predicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry policy applied to a single logical operation.
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; `0` runs the operation once.
    pub max_retries: u32,
    /// Delay before each retry.
    pub backoff: Arc<dyn BackoffStrategy>,
    /// Wall-clock ceiling across all attempts and waits.
    pub total_timeout: Duration,
    /// Decides whether a failure is worth another attempt.
    pub is_retryable: Predicate,
}

impl RetryConfig {
    /// Retries up to `max_retries` times without delay, using the default
    /// predicate and no total timeout.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Arc::new(NoBackoff),
            total_timeout: Duration::MAX,
            is_retryable: Arc::new(is_retryable),
        }
    }

    /// Runs the operation exactly once.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_backoff(mut self, backoff: impl BackoffStrategy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn with_total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = total_timeout;
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("total_timeout", &self.total_timeout)
            .finish_non_exhaustive()
    }
}

/// Default retryability: timeouts, connectivity failures and exhausted inner
/// retry layers.
pub fn is_retryable(err: &Error) -> bool {
    matches!(
        err,
        Error::Timeout(_) | Error::Connectivity(_) | Error::RetriesExhausted { .. }
    )
}

/// Treats throttling and transient server statuses as retryable.
///
/// Combine with [`is_retryable`] through [`RetryConfig::with_predicate`] to
/// retry on `429`, `500`, `502`, `503` and `504` responses.
pub fn is_retryable_status(err: &Error) -> bool {
    match err {
        Error::UnexpectedStatus { status, .. } => matches!(
            *status,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        ),
        _ => false,
    }
}

/// Runs `operation` under `config`.
///
/// Terminal failures (see [`Error::is_terminal`]) are returned immediately
/// whatever the predicate says. With `max_retries == 0` any failure is returned as is. Otherwise a
/// retryable failure on the final attempt, or one whose backoff would cross
/// `total_timeout`, is wrapped in [`Error::RetriesExhausted`].
pub async fn retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 1u32;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if config.max_retries == 0 || err.is_terminal() || !(config.is_retryable)(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(exhausted(attempt, err));
        }

        let delay = config.backoff.delay(attempt);
        let deadline_crossed = started
            .elapsed()
            .checked_add(delay)
            .map_or(true, |total| total > config.total_timeout);
        if deadline_crossed {
            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, ?delay, "retry would exceed total timeout");
            return Err(exhausted(attempt, err));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, ?delay, error = %err, "retrying after failure");

        sleep(delay).await;
        attempt += 1;
    }
}

fn exhausted(attempts: u32, last: Error) -> Error {
    Error::RetriesExhausted {
        attempts,
        source: Box::new(last),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use tokio::time::Instant;

    use super::*;
    use crate::backoff::ConstantBackoff;

    fn table_flip() -> Error {
        Error::Decode("(╯°□°)╯︵ ┻━┻".to_owned())
    }

    fn timeout() -> Error {
        Error::Timeout(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn success_runs_once() {
        let count = AtomicU32::new(0);
        let value = retry(&RetryConfig::new(10), || async {
            count.fetch_add(1, Ordering::SeqCst);
            Ok("foo")
        })
        .await
        .expect("operation must succeed");

        assert_eq!(value, "foo");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_on_retryable_error() {
        let count = AtomicU32::new(0);
        let config = RetryConfig::new(4).with_predicate(|err| matches!(err, Error::Decode(_)));
        let value = retry(&config, || async {
            if count.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(table_flip());
            }
            Ok(100_500)
        })
        .await
        .expect("third attempt must succeed");

        assert_eq!(value, 100_500);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_delays_are_respected() {
        let attempts_seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = attempts_seen.clone();
        let strategy = move |attempt: u32| {
            recorder.lock().expect("lock").push(attempt);
            Duration::from_millis(25 * u64::from(attempt))
        };
        let config = RetryConfig::new(10)
            .with_backoff(strategy)
            .with_predicate(|_| true);

        let invocations = Mutex::new(Vec::new());
        let started = Instant::now();
        retry(&config, || {
            let mut times = invocations.lock().expect("lock");
            times.push(Instant::now());
            let failing = times.len() <= 3;
            async move {
                if failing {
                    Err(table_flip())
                } else {
                    Ok(0)
                }
            }
        })
        .await
        .expect("fourth attempt must succeed");

        assert_eq!(*attempts_seen.lock().expect("lock"), vec![1, 2, 3]);
        let times = invocations.into_inner().expect("lock");
        assert_eq!(times.len(), 4);
        assert!(times[0] - started < Duration::from_millis(100));
        assert!(times[1] - times[0] >= Duration::from_millis(25));
        assert!(times[2] - times[1] >= Duration::from_millis(50));
        assert!(times[3] - times[2] >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn non_retryable_error_runs_once() {
        let count = AtomicU32::new(0);
        let err = retry::<(), _, _>(&RetryConfig::new(10), || async {
            count.fetch_add(1, Ordering::SeqCst);
            Err(table_flip())
        })
        .await
        .expect_err("must fail");

        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_retry_surfaces_original_error() {
        let count = AtomicU32::new(0);
        let config = RetryConfig::none().with_backoff(|_: u32| -> Duration {
            panic!("backoff must not be consulted without retries")
        });
        let err = retry::<(), _, _>(&config, || async {
            count.fetch_add(1, Ordering::SeqCst);
            Err(timeout())
        })
        .await
        .expect_err("must fail");

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_wrap_last_failure() {
        let count = AtomicU32::new(0);
        let err = retry::<(), _, _>(&RetryConfig::new(3), || async {
            let n = count.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout(Duration::from_millis(u64::from(n))))
        })
        .await
        .expect_err("must fail");

        assert_eq!(count.load(Ordering::SeqCst), 4);
        match err {
            Error::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, Error::Timeout(d) if d == Duration::from_millis(3)));
            }
            other => panic!("expected retries exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn total_timeout_stops_before_waiting() {
        let count = AtomicU32::new(0);
        let config = RetryConfig::new(5)
            .with_backoff(ConstantBackoff(Duration::from_secs(60)))
            .with_total_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = retry::<(), _, _>(&config, || async {
            count.fetch_add(1, Ordering::SeqCst);
            Err(timeout())
        })
        .await
        .expect_err("must fail");

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn nested_retry_layers_compose() {
        let count = AtomicU32::new(0);
        let inner = RetryConfig::new(1);
        let outer = RetryConfig::new(2);
        let err = retry::<(), _, _>(&outer, || {
            retry(&inner, || async {
                count.fetch_add(1, Ordering::SeqCst);
                Err(timeout())
            })
        })
        .await
        .expect_err("must fail");

        assert_eq!(count.load(Ordering::SeqCst), 6);
        assert!(matches!(err.last_cause(), Error::Timeout(_)));
    }

    #[tokio::test]
    async fn custom_predicate_can_stop_nesting() {
        let count = AtomicU32::new(0);
        let inner = RetryConfig::new(1);
        let outer = RetryConfig::new(2).with_predicate(|err| matches!(err, Error::Timeout(_)));
        let err = retry::<(), _, _>(&outer, || {
            retry(&inner, || async {
                count.fetch_add(1, Ordering::SeqCst);
                Err(timeout())
            })
        })
        .await
        .expect_err("must fail");

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn terminal_errors_ignore_predicate() {
        let count = AtomicU32::new(0);
        let config = RetryConfig::new(5).with_predicate(|_| true);
        let err = retry::<(), _, _>(&config, || async {
            count.fetch_add(1, Ordering::SeqCst);
            Err(Error::BodyAlreadyConsumed)
        })
        .await
        .expect_err("must fail");

        assert!(matches!(err, Error::BodyAlreadyConsumed));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_predicate_matches_transient_statuses() {
        let unexpected = |status| Error::UnexpectedStatus {
            status,
            headers: Default::default(),
            body: Default::default(),
        };
        assert!(is_retryable_status(&unexpected(StatusCode::SERVICE_UNAVAILABLE)));
        assert!(!is_retryable_status(&unexpected(StatusCode::NOT_FOUND)));
        assert!(!is_retryable(&unexpected(StatusCode::SERVICE_UNAVAILABLE)));
        assert!(!is_retryable_status(&timeout()));
    }
}
