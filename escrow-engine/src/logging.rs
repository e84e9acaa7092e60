//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; binaries and tests that want to
//! see them call [`init_logging`] once.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{error::EscrowError, EscrowResult};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Include the event target (module path) in each line
    pub with_target: bool,
    /// One line per event instead of the multi-line pretty format
    pub compact: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "escrow_engine=info".to_string(),
            with_target: false,
            compact: true,
        }
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `config.filter`. Returns `false` when a
/// global subscriber was already installed, which leaves that one in place.
pub fn init_logging(config: &LoggingConfig) -> EscrowResult<bool> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.filter),
    }
    .map_err(|e| EscrowError::config(format!("bad log filter: {}", e)))?;

    let subscriber = tracing_subscriber::registry().with(filter);
    let result = if config.compact {
        subscriber
            .with(fmt::layer().compact().with_target(config.with_target))
            .try_init()
    } else {
        subscriber
            .with(fmt::layer().pretty().with_target(config.with_target))
            .try_init()
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) => {
            tracing::debug!("Keeping existing subscriber: {}", e);
            Ok(false)
        }
    }
}
