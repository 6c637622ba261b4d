//! Guarded calls: timeout and fallback around a dependency invocation
//!
//! A guarded call hands the work to a [`Breaker`] group and, when the breaker
//! reports a failure, optionally substitutes the result of a fallback. The
//! work is attempted exactly once per call; retrying is the job of
//! [`crate::retry`].

use crate::breaker::{Breaker, BreakerRegistry};
use crate::error::CallError;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Runs dependency calls under a breaker collaborator
///
/// # Example
/// ```no_run
/// use microservice_resilience::{Breaker, BreakerSettings, GuardedCall};
/// use std::time::Duration;
///
/// # async fn example() {
/// let guard = GuardedCall::global();
/// guard
///     .breaker()
///     .configure("pricing", BreakerSettings::with_timeout(Duration::from_millis(500)));
///
/// let price = guard
///     .call_with_fallback(
///         "pricing",
///         || async { Err::<u64, _>("pricing service unavailable") },
///         |_err| async { Ok::<_, std::convert::Infallible>(0) },
///     )
///     .await;
/// assert_eq!(price, Ok(0));
/// # }
/// ```
#[derive(Debug)]
pub struct GuardedCall<B = BreakerRegistry> {
    breaker: Arc<B>,
}

impl<B> Clone for GuardedCall<B> {
    fn clone(&self) -> Self {
        Self {
            breaker: self.breaker.clone(),
        }
    }
}

impl GuardedCall<BreakerRegistry> {
    /// Guarded calls backed by the process-wide breaker registry
    pub fn global() -> Self {
        Self::new(BreakerRegistry::global())
    }
}

impl<B: Breaker> GuardedCall<B> {
    /// Create guarded calls backed by the given breaker
    pub fn new(breaker: Arc<B>) -> Self {
        Self { breaker }
    }

    /// The breaker collaborator
    pub fn breaker(&self) -> &Arc<B> {
        &self.breaker
    }

    /// Run `work` under the group's breaker and propagate any failure
    pub async fn call<T, E, F, Fut>(&self, group: &str, work: F) -> Result<T, CallError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.breaker.run(group, work).await
    }

    /// Run `work` under the group's breaker, answering failures with `fallback`
    ///
    /// The fallback receives the failure and its result replaces the call's
    /// result entirely, including its error type.
    pub async fn call_with_fallback<T, E, FE, F, Fut, FB, FbFut>(
        &self,
        group: &str,
        work: F,
        fallback: FB,
    ) -> Result<T, FE>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        FB: FnOnce(CallError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, FE>>,
    {
        match self.breaker.run(group, work).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(
                    group = group,
                    timeout = err.is_timeout(),
                    circuit_open = err.is_circuit_open(),
                    "guarded call failed, invoking fallback"
                );
                fallback(err).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerSettings;
    use crate::error::Rejection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const RESULT: &str = "Done";

    /// Breaker double that rejects every call without running the work
    struct RejectingBreaker {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Breaker for RejectingBreaker {
        fn configure(&self, _group: &str, _settings: BreakerSettings) {}

        async fn run<T, E, F, Fut>(&self, group: &str, _work: F) -> Result<T, CallError<E>>
        where
            T: Send + 'static,
            E: Send + 'static,
            F: FnOnce() -> Fut + Send + 'static,
            Fut: Future<Output = Result<T, E>> + Send + 'static,
        {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(Rejection::CircuitOpen {
                group: group.to_string(),
            }
            .into())
        }
    }

    fn guard(timeout: Duration) -> GuardedCall {
        let registry = Arc::new(BreakerRegistry::new());
        registry.configure("my_command", BreakerSettings::with_timeout(timeout));
        GuardedCall::new(registry)
    }

    #[tokio::test]
    async fn test_run_successfully() {
        let guard = guard(Duration::from_secs(2));

        let ret = guard
            .call("my_command", || async { Ok::<_, String>(RESULT) })
            .await;

        assert_eq!(ret, Ok(RESULT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cut_off_when_timeout() {
        let guard = guard(Duration::from_secs(1));

        let ret = guard
            .call("my_command", || async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<_, String>(RESULT)
            })
            .await;

        assert!(ret.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_error_is_propagated_without_fallback() {
        let guard = guard(Duration::from_secs(1));

        let ret = guard
            .call("my_command", || async { Err::<&str, _>("Error occurred") })
            .await;

        assert_eq!(ret, Err(CallError::WorkFailed("Error occurred")));
    }

    #[tokio::test]
    async fn test_fallback_replaces_error() {
        let guard = guard(Duration::from_secs(1));
        let seen = Arc::new(std::sync::Mutex::new(None));

        let recorded = seen.clone();
        let ret = guard
            .call_with_fallback(
                "my_command",
                || async { Err::<&str, _>("Error occurred") },
                |err| async move {
                    *recorded.lock().unwrap() = Some(err);
                    Ok::<_, String>("Fallback")
                },
            )
            .await;

        assert_eq!(ret, Ok("Fallback"));
        assert_eq!(
            *seen.lock().unwrap(),
            Some(CallError::WorkFailed("Error occurred"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_timeout() {
        let guard = guard(Duration::from_millis(100));

        let ret = guard
            .call_with_fallback(
                "my_command",
                || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, String>("slow")
                },
                |err| async move {
                    assert!(err.is_timeout());
                    Ok::<_, String>("cached")
                },
            )
            .await;

        assert_eq!(ret, Ok("cached"));
    }

    #[tokio::test]
    async fn test_fallback_error_is_returned() {
        let guard = guard(Duration::from_secs(1));

        let ret = guard
            .call_with_fallback(
                "my_command",
                || async { Err::<(), _>("primary down") },
                |_err| async { Err::<(), _>("secondary down") },
            )
            .await;

        assert_eq!(ret, Err("secondary down"));
    }

    #[tokio::test]
    async fn test_success_skips_fallback() {
        let guard = guard(Duration::from_secs(1));
        let fallbacks = Arc::new(AtomicUsize::new(0));

        let counter = fallbacks.clone();
        let ret = guard
            .call_with_fallback(
                "my_command",
                || async { Ok::<_, String>(RESULT) },
                |_err| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("Fallback")
                },
            )
            .await;

        assert_eq!(ret, Ok(RESULT));
        assert_eq!(fallbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_custom_breaker_collaborator() {
        let breaker = Arc::new(RejectingBreaker {
            runs: AtomicUsize::new(0),
        });
        let guard = GuardedCall::new(breaker.clone());

        let ret = guard.call("orders", || async { Ok::<_, String>(1) }).await;
        assert!(ret.unwrap_err().is_circuit_open());

        let ret = guard
            .call_with_fallback(
                "orders",
                || async { Ok::<_, String>(1) },
                |_err| async { Ok::<_, String>(0) },
            )
            .await;
        assert_eq!(ret, Ok(0));
        assert_eq!(breaker.runs.load(Ordering::SeqCst), 2);
    }
}
