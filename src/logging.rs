//! Tracing subscriber setup for embedders and tests

use crate::error::{Error, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a console subscriber at `level`, refined by `RUST_LOG` directives
///
/// Returns an error if a global subscriber is already installed.
pub fn init(level: &str) -> Result<()> {
    let log_level = level
        .parse::<tracing::Level>()
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install subscriber: {}", e)))
}

/// Install the subscriber if none is present yet (test helper)
pub fn init_for_tests() {
    let _ = init("debug");
}
