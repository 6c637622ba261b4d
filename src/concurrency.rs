//! Concurrency limiting with admission tickets
//!
//! A [`ConcurrencyLimiter`] owns a fixed pool of indistinguishable tickets.
//! A task must hold a ticket while it runs, which caps how many tasks run at
//! once. Tickets come back either explicitly through
//! [`ConcurrencyLimiter::release`] or automatically when a [`Ticket`] guard
//! is dropped.
//!
//! Waiting for a ticket is always bounded by a timeout. A waiter that times
//! out never takes a ticket with it.

use crate::config::LimiterConfig;
use crate::error::{LimiterError, ResilienceError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A held admission ticket, returned to its pool when dropped
#[derive(Debug)]
#[must_use = "the ticket is released as soon as it is dropped"]
pub struct Ticket {
    permit: OwnedSemaphorePermit,
    checked_out: Arc<AtomicUsize>,
}

impl Ticket {
    /// Keep the ticket checked out past this guard's lifetime
    ///
    /// The caller becomes responsible for a matching
    /// [`ConcurrencyLimiter::release`].
    pub fn forget(self) {
        self.checked_out.fetch_add(1, Ordering::AcqRel);
        self.permit.forget();
    }
}

/// Caps the number of concurrently running tasks
///
/// # Example
/// ```no_run
/// use microservice_resilience::ConcurrencyLimiter;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = ConcurrencyLimiter::new(10)?;
///
/// let handle = limiter
///     .run_guarded(
///         |order_id: u64| async move {
///             // call the fulfilment service for `order_id`
///             order_id
///         },
///         Duration::from_secs(2),
///         42,
///     )
///     .await?;
///
/// assert_eq!(handle.await?, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    /// Tickets handed out without a guard, each owed one `release`
    checked_out: Arc<AtomicUsize>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter whose pool starts with `capacity` free tickets
    pub fn new(capacity: usize) -> Result<Self, ResilienceError> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(ResilienceError::InvalidConfig(format!(
                "concurrency capacity must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                capacity
            )));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            checked_out: Arc::new(AtomicUsize::new(0)),
            capacity,
        })
    }

    /// Create a limiter from configuration
    pub fn from_config(config: &LimiterConfig) -> Result<Self, ResilienceError> {
        Self::new(config.capacity)
    }

    /// Take a ticket, waiting at most `timeout`
    ///
    /// On success the caller owns one ticket and must hand it back with
    /// [`release`](Self::release) exactly once.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), LimiterError> {
        self.acquire_ticket(timeout).await?.forget();
        Ok(())
    }

    /// Take a ticket guard, waiting at most `timeout`
    pub async fn acquire_ticket(&self, timeout: Duration) -> Result<Ticket, LimiterError> {
        match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(available = self.permits.available_permits(), "ticket acquired");
                Ok(Ticket {
                    permit,
                    checked_out: self.checked_out.clone(),
                })
            }
            Ok(Err(_)) => Err(LimiterError::PoolUnavailable),
            Err(_) => {
                debug!(?timeout, "timed out waiting for a ticket");
                Err(LimiterError::WaitTimeout(timeout))
            }
        }
    }

    /// Return a ticket taken with [`acquire`](Self::acquire)
    ///
    /// A release without a matching acquire is ignored, so the pool never
    /// grows past its capacity.
    pub fn release(&self) {
        let owed = self
            .checked_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if owed.is_err() {
            warn!(
                capacity = self.capacity,
                "release without a matching acquire ignored"
            );
            return;
        }
        self.permits.add_permits(1);
    }

    /// Number of free tickets right now
    ///
    /// The value can be stale by the time it is read; use it for
    /// observability, not for admission decisions.
    pub fn available_count(&self) -> usize {
        self.permits.available_permits()
    }

    /// Total number of tickets
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire a ticket and run `task(arg)` on a new task while holding it
    ///
    /// The ticket is released when the task finishes, panics, or is aborted.
    /// If no ticket is obtained within `timeout` the task is not started.
    pub async fn run_guarded<F, Fut, A>(
        &self,
        task: F,
        timeout: Duration,
        arg: A,
    ) -> Result<JoinHandle<Fut::Output>, LimiterError>
    where
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
        A: Send + 'static,
    {
        let ticket = self.acquire_ticket(timeout).await?;

        Ok(tokio::spawn(async move {
            let _ticket = ticket;
            task(arg).await
        }))
    }

    /// Tear down the pool
    ///
    /// Current and future waiters fail with [`LimiterError::PoolUnavailable`].
    /// Tickets already handed out stay valid until released.
    pub fn close(&self) {
        info!(capacity = self.capacity, "closing ticket pool");
        self.permits.close();
    }

    /// Check if the pool was torn down
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
