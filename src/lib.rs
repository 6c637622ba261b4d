/*!
 * Microservice Resilience - fault-tolerance primitives for calling dependencies
 *
 * Four independent building blocks for services that call other services:
 * - Guarded calls: a timeout and circuit breaker around one invocation,
 *   with an optional fallback
 * - Retry with linearly growing backoff and pluggable error classification
 * - A concurrency limiter handing out a fixed number of admission tickets
 * - A token-bucket rate limiter refilled by a background task
 *
 * The primitives do not depend on each other and can be composed freely:
 *
 * ```no_run
 * use microservice_resilience::prelude::*;
 * use std::time::Duration;
 *
 * # async fn example() -> Result<(), Box<dyn std::error::Error>> {
 * let limiter = ConcurrencyLimiter::new(10)?;
 * let bucket = RateLimiter::new(3, 2, Duration::from_secs(1))?;
 * let guard = GuardedCall::global();
 * let policy = RetryPolicy::default();
 *
 * let _ticket = limiter.acquire_ticket(Duration::from_millis(100)).await?;
 * bucket.get_token(WAIT_FOREVER).await?;
 *
 * let body = retry(
 *     || {
 *         let guard = guard.clone();
 *         async move {
 *             guard
 *                 .call("catalog", || async { Ok::<_, String>("catalog page") })
 *                 .await
 *         }
 *     },
 *     &policy,
 *     &|err: &CallError<String>| err.is_timeout(),
 * )
 * .await?;
 * # let _ = body;
 * # Ok(())
 * # }
 * ```
 */

pub mod breaker;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod guarded_call;
pub mod logging;
pub mod rate_limiter;
pub mod retry;

// Re-export commonly used types
pub use breaker::{Breaker, BreakerRegistry, BreakerSettings, CircuitState};
pub use concurrency::{ConcurrencyLimiter, Ticket};
pub use config::{BucketConfig, LimiterConfig, LogLevel, LoggingConfig, ResilienceConfig};
pub use error::{CallError, LimiterError, RateLimitError, Rejection, ResilienceError, RetryError};
pub use guarded_call::GuardedCall;
pub use rate_limiter::{RateLimiter, Token, WAIT_FOREVER};
pub use retry::{
    error_text_contains, retry, Classifier, ErrorTextContains, RetryAll, RetryPolicy, SentinelSet,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything needed to wire the primitives into a service
pub mod prelude {
    pub use crate::breaker::{Breaker, BreakerRegistry, BreakerSettings};
    pub use crate::concurrency::{ConcurrencyLimiter, Ticket};
    pub use crate::error::{CallError, LimiterError, RateLimitError, RetryError};
    pub use crate::guarded_call::GuardedCall;
    pub use crate::rate_limiter::{RateLimiter, WAIT_FOREVER};
    pub use crate::retry::{retry, Classifier, ErrorTextContains, RetryPolicy, SentinelSet};
}
