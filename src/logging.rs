//! Tracing subscriber setup for the binary.
//!
//! `PRIMSTREAM_LOG` takes precedence over the configured level. Output goes
//! to stderr so stdout stays machine-readable.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PRIMSTREAM_LOG";

/// Builds the filter from `PRIMSTREAM_LOG`, then `level`, then `info`.
pub fn make_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global fmt subscriber. Calling it twice is harmless.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(make_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
