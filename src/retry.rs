//! Exponential-backoff retry wrapper (C1).
//!
//! Grounded on `with_retry_async` from the bare-metal provisioner's
//! `state.rs`, generalized with a fatal-error opt-out (`RetryOutcome::Fatal`)
//! and cooperative cancellation as required by spec §4.1.1.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation's own error, surfaced via `Fatal` or after exhausting attempts.
    Operation(E),
    /// The cancellation token fired before the operation succeeded.
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operation(e) => write!(f, "{e}"),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Retry policy parameters (spec §4.1.1).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first, is `1 + (max_attempts - 1)` retries.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Kept false by default so tests stay deterministic.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Build from the `HCLOUD_RETRY_*` environment variables (spec §6),
    /// falling back to defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_attempts = std::env::var("HCLOUD_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts);
        let initial_delay = std::env::var("HCLOUD_RETRY_INITIAL_DELAY")
            .ok()
            .and_then(|v| humantime_secs(&v))
            .unwrap_or(defaults.initial_delay);
        Self {
            max_attempts,
            initial_delay,
            ..defaults
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let mut delay = doubled.min(self.max_delay);
        if self.jitter {
            let jittered_millis = (delay.as_millis() as f64 * (0.8 + 0.4 * pseudo_random())) as u64;
            delay = Duration::from_millis(jittered_millis).min(self.max_delay);
        }
        delay
    }
}

/// Cheap deterministic-ish jitter source. Not cryptographic; only used to
/// spread retry storms when `jitter` is enabled.
fn pseudo_random() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}

fn humantime_secs(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix('s') {
        stripped.parse::<u64>().ok().map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Retry `op` per `config` until it succeeds, fails fatally, or `cancel`
/// fires. Total attempts = `1 + up to config.max_attempts - 1` retries.
pub async fn retry<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RetryOutcome<E>>>,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryOutcome::Fatal(e)) => return Err(RetryError::Operation(e)),
            Err(RetryOutcome::Retryable(e)) => {
                if attempt >= config.max_attempts {
                    return Err(RetryError::Operation(e));
                }
                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    ?delay,
                    "retrying after transient failure"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// What an operation passed to [`retry`] reports on failure.
pub enum RetryOutcome<E> {
    Retryable(E),
    Fatal(E),
}

impl<E> RetryOutcome<E> {
    /// Classify an operation result using the C2 error classifier.
    #[must_use]
    pub fn from_provider_error(err: E) -> Self
    where
        E: AsRef<crate::error::ProviderError>,
    {
        if crate::error::classify(err.as_ref()).is_retryable() {
            Self::Retryable(err)
        } else {
            Self::Fatal(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_exactly_max_attempts_on_persistent_failure() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = retry(&config, &cancel, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryOutcome::Retryable("boom")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_error_short_circuits_without_retrying() {
        let config = RetryConfig::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = retry(&config, &cancel, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryOutcome::Fatal("invalid input")) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Operation("invalid input"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_op_succeeds_immediately() {
        let config = RetryConfig::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<u32, RetryError<&str>> = retry(&config, &cancel, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_clips_at_max_delay() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop() {
        let config = RetryConfig {
            max_attempts: 100,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            jitter: false,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<&str>> =
            retry(&config, &cancel, "test-op", || async { Err(RetryOutcome::Retryable("x")) })
                .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
