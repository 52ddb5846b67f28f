//! Tracing setup.
//!
//! Everything goes to stderr; stdout belongs to the LSP transport. The
//! client's `logLevel` initialization option, when present, overrides the
//! `RUST_LOG` environment variable; with neither, the server logs at `info`.
//! ANSI color is enabled only when stderr is an actual terminal, so log
//! files and editor output channels stay clean.

use std::io::{self, IsTerminal};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::config::LogLevel;

fn level_filter_of(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

/// Installs the global subscriber. Returns `false` when a subscriber is
/// already in place (an embedding host, or a second `initialize`); the
/// existing one is kept and the call is a no-op.
pub fn init_logger(log_level: Option<LogLevel>) -> bool {
    let filter = match log_level {
        Some(level) => EnvFilter::builder()
            .with_default_directive(level_filter_of(level).into())
            .parse_lossy(""),
        None => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    };

    let stderr = io::stderr();
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_timer(UtcTime::rfc_3339())
        .with_ansi(stderr.is_terminal())
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_keeps_the_first_subscriber() {
        // Whichever call wins the race to install, later calls must not
        // panic or replace it.
        let first = init_logger(Some(LogLevel::Debug));
        let second = init_logger(None);
        assert!(!(first && second));
    }
}
