//! Circuit breaker groups backing guarded calls
//!
//! A breaker group is a named configuration bucket (timeout plus
//! open/closed/half-open policy) for one kind of dependency call. The
//! [`Breaker`] trait is the seam [`crate::GuardedCall`] depends on; the
//! [`BreakerRegistry`] is the in-process implementation shipped with this crate.
//!
//! Each group moves through three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Dependency is unhealthy, calls fail immediately
//! - HalfOpen: Cooldown elapsed, calls probe whether the dependency recovered
//!
//! # Timeout race
//!
//! The work runs on its own task and reports through a `oneshot` channel,
//! which can be written at most once. The caller waits on the receiver under
//! the group timeout. When the timeout wins, the receiver is dropped and the
//! task is aborted, so a late completion is never observed. The task is also
//! aborted when the caller drops the call before it completes.

use crate::config::duration_ms;
use crate::error::{CallError, Rejection};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timeout applied to groups that were never configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

static GLOBAL_REGISTRY: Lazy<Arc<BreakerRegistry>> =
    Lazy::new(|| Arc::new(BreakerRegistry::new()));

/// State of one breaker group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately
    /// Next probe time indicates when to try half-open
    Open { next_probe: Instant },
    /// Circuit is half-open, testing dependency recovery
    HalfOpen,
}

/// Configuration of one breaker group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Maximum time a single call may run
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Number of consecutive successes in half-open to close the circuit
    pub success_threshold: usize,
    /// Duration to wait before transitioning from open to half-open
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            failure_threshold: 20,
            success_threshold: 1,
            cooldown: Duration::from_secs(5),
        }
    }
}

impl BreakerSettings {
    /// Default policy with the given call timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// The circuit-breaker collaborator consumed by guarded calls
///
/// Implementations own the timeout and the open/closed/half-open state
/// machine. `run` must invoke `work` at most once.
#[async_trait]
pub trait Breaker: Send + Sync {
    /// Install or replace the settings of a group
    fn configure(&self, group: &str, settings: BreakerSettings);

    /// Run `work` under the named group's timeout and circuit
    async fn run<T, E, F, Fut>(&self, group: &str, work: F) -> Result<T, CallError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static;
}

/// Mutable circuit bookkeeping for a group
#[derive(Debug)]
struct GroupState {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
}

impl GroupState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

#[derive(Debug)]
struct Group {
    name: String,
    settings: BreakerSettings,
    state: Mutex<GroupState>,
}

impl Group {
    fn new(name: &str, settings: BreakerSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
            state: Mutex::new(GroupState::new()),
        }
    }

    /// Check circuit state and move to half-open once the cooldown is over
    async fn admit(&self) -> Result<(), Rejection> {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { next_probe } => {
                if Instant::now() >= next_probe {
                    debug!(group = %self.name, "circuit half-open, probing dependency");
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(Rejection::CircuitOpen {
                        group: self.name.clone(),
                    })
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;

                if state.consecutive_successes >= self.settings.success_threshold {
                    info!(group = %self.name, "circuit closed, dependency recovered");
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                }
            }
            CircuitState::Open { .. } => {
                // A call admitted before another one tripped the circuit.
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;

                if state.consecutive_failures >= self.settings.failure_threshold {
                    warn!(
                        group = %self.name,
                        failures = state.consecutive_failures,
                        cooldown = ?self.settings.cooldown,
                        "circuit opened"
                    );
                    state.state = CircuitState::Open {
                        next_probe: Instant::now() + self.settings.cooldown,
                    };
                    state.consecutive_failures = 0;
                }
            }
            CircuitState::HalfOpen => {
                warn!(group = %self.name, "probe failed, circuit reopened");
                state.state = CircuitState::Open {
                    next_probe: Instant::now() + self.settings.cooldown,
                };
                state.consecutive_successes = 0;
            }
            CircuitState::Open { .. } => {}
        }
    }
}

/// Process-wide table of named breaker groups
///
/// Groups are created with [`BreakerSettings::default`] the first time an
/// unconfigured name is used.
///
/// # Example
/// ```no_run
/// use microservice_resilience::{Breaker, BreakerRegistry, BreakerSettings};
/// use std::time::Duration;
///
/// # async fn example() {
/// let registry = BreakerRegistry::global();
/// registry.configure("inventory", BreakerSettings::with_timeout(Duration::from_secs(2)));
///
/// let stock = registry
///     .run("inventory", || async { Ok::<_, std::io::Error>(42) })
///     .await;
/// assert_eq!(stock.ok(), Some(42));
/// # }
/// ```
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process
    pub fn global() -> Arc<BreakerRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    fn group(&self, name: &str) -> Arc<Group> {
        if let Some(group) = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return group.clone();
        }

        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(group = name, "creating breaker group with default settings");
                Arc::new(Group::new(name, BreakerSettings::default()))
            })
            .clone()
    }

    /// Get the settings of a group, if it exists
    pub fn settings(&self, group: &str) -> Option<BreakerSettings> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
            .map(|g| g.settings.clone())
    }

    /// Names of all known groups
    pub fn groups(&self) -> Vec<String> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Get the current circuit state of a group
    pub async fn state(&self, group: &str) -> CircuitState {
        self.group(group).state.lock().await.state
    }

    /// Get the current consecutive failure count of a group
    pub async fn failure_count(&self, group: &str) -> usize {
        self.group(group).state.lock().await.consecutive_failures
    }

    /// Reset a group's circuit to closed
    pub async fn reset(&self, group: &str) {
        let group = self.group(group);
        let mut state = group.state.lock().await;
        *state = GroupState::new();
    }
}

/// Work task owned by a waiting caller
#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl Breaker for BreakerRegistry {
    /// Configuring a group also resets its circuit.
    fn configure(&self, group: &str, settings: BreakerSettings) {
        info!(group = group, timeout = ?settings.timeout, "configuring breaker group");
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group.to_string(), Arc::new(Group::new(group, settings)));
    }

    async fn run<T, E, F, Fut>(&self, group: &str, work: F) -> Result<T, CallError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let group = self.group(group);
        group.admit().await?;

        let timeout = group.settings.timeout;
        let (done_tx, done_rx) = oneshot::channel();
        // Aborts the work if this call is dropped while waiting.
        let _work = AbortOnDrop(tokio::spawn(async move {
            let outcome = work().await;
            // Fails only if the caller already gave up on this call.
            let _ = done_tx.send(outcome);
        }));

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(Ok(value))) => {
                group.on_success().await;
                Ok(value)
            }
            Ok(Ok(Err(e))) => {
                group.on_failure().await;
                Err(CallError::WorkFailed(e))
            }
            Ok(Err(_)) => {
                warn!(group = %group.name, "work aborted before reporting a result");
                group.on_failure().await;
                Err(Rejection::Aborted.into())
            }
            Err(_) => {
                warn!(group = %group.name, ?timeout, "execution timeout");
                group.on_failure().await;
                Err(Rejection::Timeout(timeout).into())
            }
        }
    }
}
