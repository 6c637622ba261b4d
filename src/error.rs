//! Error types for the resilience primitives
//!
//! Every failure is a named variant scoped to the component that produces it.
//! Callers match on the discriminant; nothing in this crate compares error
//! text except the substring classifier in [`crate::retry`], which is an
//! explicit, opt-in strategy.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or configuring a primitive
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// A constructor argument or config value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background task was requested outside of a Tokio runtime
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration document could not be parsed
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Configuration file could not be read or written
    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The logging subscriber could not be installed
    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

/// Why the breaker refused to deliver a result from the wrapped work
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The work did not complete within the group's timeout
    #[error("execution timeout after {0:?}")]
    Timeout(Duration),

    /// The group's circuit is open and is failing fast
    #[error("circuit open for group '{group}'")]
    CircuitOpen { group: String },

    /// The work panicked or was cancelled before reporting a result
    #[error("work aborted before completion")]
    Aborted,
}

/// Failure of a guarded call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError<E> {
    /// The breaker rejected the call (timeout, open circuit, aborted work)
    #[error("breaker rejected call: {0}")]
    BreakerRejected(Rejection),

    /// The wrapped function returned its own error
    #[error("work failed: {0}")]
    WorkFailed(E),
}

impl<E> CallError<E> {
    /// Check if the call was cut off by the group timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::BreakerRejected(Rejection::Timeout(_)))
    }

    /// Check if the call was refused because the circuit is open
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CallError::BreakerRejected(Rejection::CircuitOpen { .. }))
    }

    /// Get the work's own error, if that is what failed
    pub fn work_error(&self) -> Option<&E> {
        match self {
            CallError::WorkFailed(e) => Some(e),
            CallError::BreakerRejected(_) => None,
        }
    }
}

impl<E> From<Rejection> for CallError<E> {
    fn from(rejection: Rejection) -> Self {
        CallError::BreakerRejected(rejection)
    }
}

/// Failure of a retried operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed; carries the last attempt's error
    #[error("retries exhausted after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    /// The classifier refused another attempt; carries the rejected error
    #[error("non-retryable error on attempt {attempts}: {error}")]
    NonRetryable { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::NonRetryable { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Borrow the error produced by the final attempt
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => {
                error
            }
        }
    }

    /// Unwrap into the error produced by the final attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => {
                error
            }
        }
    }
}

/// Failure to obtain an admission ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// No ticket became free before the wait timed out
    #[error("ticket waiting timed out after {0:?}")]
    WaitTimeout(Duration),

    /// The limiter has been closed and will never hand out tickets again
    #[error("ticket pool is not available")]
    PoolUnavailable,
}

impl LimiterError {
    /// Check if the caller may back off and try again
    pub fn is_transient(&self) -> bool {
        matches!(self, LimiterError::WaitTimeout(_))
    }

    /// Check if the limiter is permanently unusable
    pub fn is_terminal(&self) -> bool {
        matches!(self, LimiterError::PoolUnavailable)
    }
}

/// Failure to draw a rate-limit token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Non-blocking probe found the bucket empty
    #[error("no token available")]
    NoToken,

    /// No token arrived before the wait timed out
    #[error("failed to get token within {0:?}")]
    GetTokenTimeout(Duration),

    /// Refilling has stopped and the bucket is drained
    #[error("token bucket is closed")]
    BucketClosed,
}

impl RateLimitError {
    /// Check if a later attempt may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, RateLimitError::BucketClosed)
    }
}
