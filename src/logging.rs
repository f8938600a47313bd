//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Output goes to stderr
//! so command output on stdout stays machine-readable.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{AppResult, SigGenError};

/// Install the global subscriber described by `config`.
///
/// # Errors
/// `Configuration` if a subscriber is already installed or the filter is invalid.
pub fn init(config: &ApplicationConfig) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| SigGenError::Configuration(format!("Invalid log filter: {e}")))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if config.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| SigGenError::Configuration(format!("Logging already initialised: {e}")))
}
