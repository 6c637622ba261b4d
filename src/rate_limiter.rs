//! Rate limiting with a refilled token bucket
//!
//! The bucket holds at most `capacity` timestamped tokens and starts full.
//! A background task drips tokens back in: one token every
//! `interval / tokens_per_interval`, starting one such period after
//! construction. A token offered to a full bucket is dropped, so the refill
//! task never waits on consumers and bursts never exceed `capacity`.
//!
//! Callers either probe without waiting ([`RateLimiter::try_get_token`]) or
//! wait for the next token ([`RateLimiter::get_token`]), optionally bounded
//! by a timeout. Waiters are not guaranteed to be served in arrival order.
//!
//! The refill task stops when [`RateLimiter::stop`] is called or when the
//! limiter is dropped.

use crate::config::BucketConfig;
use crate::error::{RateLimitError, ResilienceError};
use std::future::Future;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Pass to [`RateLimiter::get_token`] to wait as long as it takes
pub const WAIT_FOREVER: Option<Duration> = None;

/// Permission to issue one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    deposited_at: Instant,
}

impl Token {
    /// When the token was put into the bucket
    pub fn deposited_at(&self) -> Instant {
        self.deposited_at
    }

    /// How long the token sat in the bucket
    pub fn age(&self) -> Duration {
        self.deposited_at.elapsed()
    }
}

/// Handle on the background refill task
#[derive(Debug)]
struct RefillTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Token-bucket rate limiter
///
/// # Example
/// ```no_run
/// use microservice_resilience::rate_limiter::{RateLimiter, WAIT_FOREVER};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Bursts of up to 3 requests, refilled at 2 tokens per second
/// let limiter = RateLimiter::new(3, 2, Duration::from_secs(1))?;
///
/// let token = limiter.get_token(WAIT_FOREVER).await?;
/// // call the downstream service
/// # let _ = token;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<mpsc::Receiver<Token>>,
    capacity: usize,
    tokens_per_interval: u32,
    interval: Duration,
    refill_period: Duration,
    refill: StdMutex<Option<RefillTask>>,
}

impl RateLimiter {
    /// Create a full bucket and start refilling it
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tokens the bucket holds
    /// * `tokens_per_interval` - Tokens added per `interval`
    /// * `interval` - Refill interval, split evenly between its tokens
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        capacity: usize,
        tokens_per_interval: u32,
        interval: Duration,
    ) -> Result<Self, ResilienceError> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(ResilienceError::InvalidConfig(format!(
                "bucket capacity must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                capacity
            )));
        }
        if tokens_per_interval == 0 {
            return Err(ResilienceError::InvalidConfig(
                "tokens_per_interval must be > 0".to_string(),
            ));
        }
        let refill_period = interval / tokens_per_interval;
        if refill_period.is_zero() {
            return Err(ResilienceError::InvalidConfig(format!(
                "refill interval {:?} is too short for {} tokens",
                interval, tokens_per_interval
            )));
        }

        let runtime = Handle::try_current().map_err(|e| ResilienceError::NoRuntime(e.to_string()))?;

        let (deposit, bucket) = mpsc::channel(capacity);
        let now = Instant::now();
        for _ in 0..capacity {
            if deposit.try_send(Token { deposited_at: now }).is_err() {
                break;
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = runtime.spawn(run_refill_loop(deposit, refill_period, shutdown_rx));
        info!(capacity, tokens_per_interval, ?interval, ?refill_period, "token bucket started");

        Ok(Self {
            bucket: Mutex::new(bucket),
            capacity,
            tokens_per_interval,
            interval,
            refill_period,
            refill: StdMutex::new(Some(RefillTask {
                shutdown: shutdown_tx,
                handle,
            })),
        })
    }

    /// Create a rate limiter with requests per second
    pub fn per_second(requests_per_second: u32) -> Result<Self, ResilienceError> {
        Self::new(
            requests_per_second as usize,
            requests_per_second,
            Duration::from_secs(1),
        )
    }

    /// Create a rate limiter from configuration
    pub fn from_config(config: &BucketConfig) -> Result<Self, ResilienceError> {
        Self::new(config.capacity, config.tokens_per_interval, config.interval)
    }

    /// Take a token if one is available, without waiting
    ///
    /// A probe racing a caller blocked in [`get_token`](Self::get_token)
    /// reports [`RateLimitError::NoToken`].
    pub fn try_get_token(&self) -> Result<Token, RateLimitError> {
        let mut bucket = self.bucket.try_lock().map_err(|_| RateLimitError::NoToken)?;

        match bucket.try_recv() {
            Ok(token) => Ok(token),
            Err(TryRecvError::Empty) => Err(RateLimitError::NoToken),
            Err(TryRecvError::Disconnected) => Err(RateLimitError::BucketClosed),
        }
    }

    /// Take a token, waiting up to `timeout` or forever for [`WAIT_FOREVER`]
    ///
    /// A caller that times out leaves the bucket untouched.
    pub async fn get_token(&self, timeout: Option<Duration>) -> Result<Token, RateLimitError> {
        let draw = async {
            let mut bucket = self.bucket.lock().await;
            bucket.recv().await.ok_or(RateLimitError::BucketClosed)
        };

        match timeout {
            None => draw.await,
            Some(limit) => tokio::time::timeout(limit, draw)
                .await
                .unwrap_or(Err(RateLimitError::GetTokenTimeout(limit))),
        }
    }

    /// Execute an operation once a token is available
    pub async fn execute<F, Fut>(
        &self,
        timeout: Option<Duration>,
        op: F,
    ) -> Result<Fut::Output, RateLimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.get_token(timeout).await?;
        Ok(op().await)
    }

    /// Execute an operation only if a token is available right now
    pub async fn try_execute<F, Fut>(&self, op: F) -> Result<Fut::Output, RateLimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.try_get_token()?;
        Ok(op().await)
    }

    /// Stop refilling and wait for the refill task to finish
    ///
    /// Tokens already in the bucket can still be drawn; once they are gone
    /// every draw fails with [`RateLimitError::BucketClosed`].
    pub async fn stop(&self) {
        let task = self
            .refill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
            info!(capacity = self.capacity, "token bucket refill stopped");
        }
    }

    /// Check if the refill task is still running
    pub fn is_refilling(&self) -> bool {
        self.refill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Tokens currently in the bucket (best-effort snapshot)
    ///
    /// Reports 0 while a caller blocked in [`get_token`](Self::get_token)
    /// holds the bucket, even if tokens arrive meanwhile.
    pub fn available(&self) -> usize {
        self.bucket
            .try_lock()
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Maximum number of tokens the bucket holds
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens added per interval
    pub fn tokens_per_interval(&self) -> u32 {
        self.tokens_per_interval
    }

    /// The refill interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time between two single-token refills
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }
}

/// Offer one token per period until shut down or the bucket is dropped
async fn run_refill_loop(
    deposit: mpsc::Sender<Token>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Also fires when the limiter, and with it the sender, is dropped.
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                match deposit.try_send(Token { deposited_at: Instant::now() }) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }

    debug!("refill loop exited");
}
