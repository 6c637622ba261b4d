/*!
 * Logging and tracing initialization
 *
 * The primitives only emit `tracing` events. Services that do not install
 * their own subscriber can use [`init_logging`].
 */

use std::sync::Once;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::ResilienceError;

/// Install a global subscriber for the crate's events
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ResilienceError> {
    let log_level = tracing::Level::from(config.level);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("microservice_resilience={}", log_level)))
        .map_err(|e| ResilienceError::Logging(format!("Failed to create log filter: {}", e)))?;

    if config.json {
        init_json_logging(env_filter)
    } else {
        init_compact_logging(env_filter)
    }
}

/// Compact single-line output on stdout
fn init_compact_logging(env_filter: EnvFilter) -> Result<(), ResilienceError> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ResilienceError::Logging(e.to_string()))
}

/// JSON lines for log shippers
fn init_json_logging(env_filter: EnvFilter) -> Result<(), ResilienceError> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ResilienceError::Logging(e.to_string()))
}

/// Initialize logging with custom format for testing
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("microservice_resilience=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}
