//! Bounded retries with linear backoff
//!
//! [`retry`] re-invokes an operation until it succeeds, the policy's retry
//! budget is spent, or the [`Classifier`] declares the error not worth
//! another attempt. Backoff grows by a fixed increment after every retry:
//! retry `i` (0-indexed) waits `initial_backoff + i * backoff_increment`.
//!
//! # Example
//!
//! ```
//! use microservice_resilience::retry::{retry, ErrorTextContains, RetryPolicy};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
//! let classifier = ErrorTextContains::new(["connection reset"]);
//!
//! let mut calls = 0;
//! let result = retry(
//!     || {
//!         calls += 1;
//!         let attempt = calls;
//!         async move {
//!             if attempt < 2 {
//!                 Err("connection reset by peer".to_string())
//!             } else {
//!                 Ok(attempt)
//!             }
//!         }
//!     },
//!     &policy,
//!     &classifier,
//! )
//! .await;
//!
//! assert_eq!(result, Ok(2));
//! # }
//! ```

use crate::config::duration_ms;
use crate::error::RetryError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::mem::Discriminant;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently to retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_attempts: u32,
    /// Wait before the first retry
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Amount added to the wait after every retry
    #[serde(rename = "backoff_increment_ms", with = "duration_ms")]
    pub backoff_increment: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_increment: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy
    pub fn new(max_attempts: u32, initial_backoff: Duration, backoff_increment: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            backoff_increment,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Wait before retry `retry` (0-indexed)
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_add(self.backoff_increment.saturating_mul(retry))
    }

    /// Total wait across the first `retries` retries
    pub fn total_backoff(&self, retries: u32) -> Duration {
        (0..retries).fold(Duration::ZERO, |total, i| total.saturating_add(self.backoff(i)))
    }
}

/// Decides whether a failed attempt is worth repeating
pub trait Classifier<E> {
    /// `true` if another attempt may succeed
    fn is_retryable(&self, error: &E) -> bool;
}

impl<E, F> Classifier<E> for F
where
    F: Fn(&E) -> bool,
{
    fn is_retryable(&self, error: &E) -> bool {
        self(error)
    }
}

/// Treats every error as retryable
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl<E> Classifier<E> for RetryAll {
    fn is_retryable(&self, _error: &E) -> bool {
        true
    }
}

/// Case-insensitive check whether an error's text contains `needle`
pub fn error_text_contains<E: Display + ?Sized>(error: &E, needle: &str) -> bool {
    error
        .to_string()
        .to_lowercase()
        .contains(&needle.to_lowercase())
}

/// Retries errors whose text contains one of the configured flags
#[derive(Debug, Clone, Default)]
pub struct ErrorTextContains {
    flags: Vec<String>,
    ignore_case: bool,
}

impl ErrorTextContains {
    /// Match any of `flags`, case-sensitively
    pub fn new<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            flags: flags.into_iter().map(Into::into).collect(),
            ignore_case: false,
        }
    }

    /// Match flags regardless of case
    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    /// The configured flags
    pub fn flags(&self) -> &[String] {
        &self.flags
    }
}

impl<E: Display> Classifier<E> for ErrorTextContains {
    fn is_retryable(&self, error: &E) -> bool {
        if self.ignore_case {
            return self
                .flags
                .iter()
                .any(|flag| error_text_contains(error, flag));
        }
        let text = error.to_string();
        self.flags.iter().any(|flag| text.contains(flag.as_str()))
    }
}

/// Retries errors that are members of an explicit set of sentinel values
///
/// Membership is decided by equality, or by enum variant alone when built
/// with [`SentinelSet::variants`].
#[derive(Debug, Clone)]
pub struct SentinelSet<E> {
    sentinels: Vec<E>,
    variants: Option<Vec<Discriminant<E>>>,
}

impl<E> SentinelSet<E> {
    /// Retry errors equal to one of `sentinels`
    pub fn new(sentinels: impl IntoIterator<Item = E>) -> Self {
        Self {
            sentinels: sentinels.into_iter().collect(),
            variants: None,
        }
    }

    /// Retry errors of the same enum variant as one of `sentinels`,
    /// ignoring any payload
    pub fn variants(sentinels: impl IntoIterator<Item = E>) -> Self {
        let sentinels: Vec<E> = sentinels.into_iter().collect();
        let variants = sentinels.iter().map(std::mem::discriminant).collect();
        Self {
            sentinels,
            variants: Some(variants),
        }
    }

    /// The sentinel values
    pub fn sentinels(&self) -> &[E] {
        &self.sentinels
    }
}

impl<E: PartialEq> Classifier<E> for SentinelSet<E> {
    fn is_retryable(&self, error: &E) -> bool {
        match &self.variants {
            Some(variants) => variants.contains(&std::mem::discriminant(error)),
            None => self.sentinels.contains(error),
        }
    }
}

/// Run `work` until it succeeds or the policy or classifier stops retrying
///
/// Attempts are sequential; the backoff sleep suspends only the calling
/// task. With `max_attempts = 0` the work runs exactly once.
pub async fn retry<T, E, F, Fut, C>(
    mut work: F,
    policy: &RetryPolicy,
    classifier: &C,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Classifier<E> + ?Sized,
{
    let mut attempts: u32 = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempts += 1;

        let error = match work().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempts, "operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !classifier.is_retryable(&error) {
            debug!(attempts, "error classified as non-retryable");
            return Err(RetryError::NonRetryable { attempts, error });
        }

        if attempts > policy.max_attempts {
            warn!(
                attempts,
                max_attempts = policy.max_attempts,
                "retries exhausted"
            );
            return Err(RetryError::Exhausted { attempts, error });
        }

        debug!(attempt = attempts, ?backoff, "attempt failed, backing off");
        tokio::time::sleep(backoff).await;
        backoff = backoff.saturating_add(policy.backoff_increment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    const RESULT: &str = "Done";

    #[derive(Debug, Clone, PartialEq)]
    enum DownstreamError {
        Unavailable,
        Throttled { retry_after_ms: u64 },
        BadRequest(String),
    }

    impl Display for DownstreamError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                DownstreamError::Unavailable => write!(f, "service unavailable"),
                DownstreamError::Throttled { retry_after_ms } => {
                    write!(f, "throttled, retry after {}ms", retry_after_ms)
                }
                DownstreamError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            }
        }
    }

    fn settings() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_millis(500))
    }

    #[test]
    fn test_backoff_is_linear() {
        let policy = settings();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_millis(1500));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.total_backoff(3), Duration::from_millis(4500));
        assert_eq!(policy.total_backoff(0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(1, Duration::MAX, Duration::from_secs(1));
        assert_eq!(policy.backoff(5), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_retry_when_error_occurs() {
        let executed = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = retry(
            || {
                executed.fetch_add(1, Ordering::SeqCst);
                async { Err("Retryable") }
            },
            &settings(),
            &ErrorTextContains::new(["Retryable"]),
        )
        .await;

        assert_eq!(executed.load(Ordering::SeqCst), 4);
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                error: "Retryable"
            })
        );
        assert!(start.elapsed() >= settings().total_backoff(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_retry_succeeds_after_retry() {
        let executed = AtomicU32::new(0);

        let result = retry(
            || {
                let attempt = executed.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt > 1 {
                        Ok(RESULT)
                    } else {
                        Err("Retryable")
                    }
                }
            },
            &settings(),
            &RetryAll,
        )
        .await;

        assert_eq!(executed.load(Ordering::SeqCst), 2);
        assert_eq!(result, Ok(RESULT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let executed = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = retry(
            || {
                executed.fetch_add(1, Ordering::SeqCst);
                async { Err(DownstreamError::BadRequest("missing sku".to_string())) }
            },
            &RetryPolicy::new(10, Duration::from_secs(1), Duration::ZERO),
            &SentinelSet::new([DownstreamError::Unavailable]),
        )
        .await;

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(RetryError::NonRetryable { attempts: 1, .. })
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_runs_once() {
        let executed = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = retry(
            || {
                executed.fetch_add(1, Ordering::SeqCst);
                async { Err(DownstreamError::Unavailable) }
            },
            &RetryPolicy::no_retry(),
            &RetryAll,
        )
        .await;

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_consulted_on_every_failure() {
        let executed = AtomicU32::new(0);

        // Throttled twice, then a hard failure.
        let result: Result<(), _> = retry(
            || {
                let attempt = executed.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt <= 2 {
                        Err(DownstreamError::Throttled {
                            retry_after_ms: 100,
                        })
                    } else {
                        Err(DownstreamError::BadRequest("quota".to_string()))
                    }
                }
            },
            &RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(10)),
            &SentinelSet::variants([DownstreamError::Throttled { retry_after_ms: 0 }]),
        )
        .await;

        assert_eq!(executed.load(Ordering::SeqCst), 3);
        assert_eq!(
            result,
            Err(RetryError::NonRetryable {
                attempts: 3,
                error: DownstreamError::BadRequest("quota".to_string())
            })
        );
    }

    #[test]
    fn test_text_classifier() {
        let exact = ErrorTextContains::new(["unavailable", "throttled"]);
        assert!(exact.is_retryable(&DownstreamError::Unavailable));
        assert!(!exact.is_retryable(&DownstreamError::BadRequest("x".to_string())));
        assert!(!exact.is_retryable(&"Service Unavailable"));

        let relaxed = ErrorTextContains::new(["unavailable"]).ignore_case();
        assert!(relaxed.is_retryable(&"Service Unavailable"));
        assert_eq!(relaxed.flags(), &["unavailable".to_string()]);
    }

    #[test]
    fn test_sentinel_classifier_equality_vs_variant() {
        let exact = SentinelSet::new([DownstreamError::Throttled { retry_after_ms: 50 }]);
        assert!(exact.is_retryable(&DownstreamError::Throttled { retry_after_ms: 50 }));
        assert!(!exact.is_retryable(&DownstreamError::Throttled { retry_after_ms: 80 }));

        let by_variant = SentinelSet::variants([DownstreamError::Throttled { retry_after_ms: 0 }]);
        assert!(by_variant.is_retryable(&DownstreamError::Throttled { retry_after_ms: 80 }));
        assert!(!by_variant.is_retryable(&DownstreamError::Unavailable));
        assert_eq!(by_variant.sentinels().len(), 1);
    }

    #[test]
    fn test_closure_classifier_and_timeout_text() {
        let is_timeout = |e: &String| error_text_contains(e, "timeout");
        assert!(is_timeout.is_retryable(&"Read TIMEOUT on socket".to_string()));
        assert!(!is_timeout.is_retryable(&"refused".to_string()));
    }
}
