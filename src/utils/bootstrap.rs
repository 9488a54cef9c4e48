//! Bootstrap utilities for mqbridge binaries.
//!
//! Shared logging initialization.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat, LOG_ENV_VAR};

/// Build the filter: `MQBRIDGE_LOG` wins over the configured level.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global tracing subscriber described by `config`.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_tracing(config: &LogConfig) -> bool {
    let registry = tracing_subscriber::registry().with(env_filter(config));
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_ansi(config.color))
            .try_init(),
    };
    installed.is_ok()
}
