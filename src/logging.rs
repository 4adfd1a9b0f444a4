/// Tracing subscriber setup
use crate::config::{ConfigError, LoggingConfig};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to the configured level
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, so calling
/// this more than once is harmless.
pub fn init(config: &LoggingConfig) -> Result<bool, ConfigError> {
    let json = config.format == "json";
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));

    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ConfigError::IoError(format!("{}: {}", path, e)))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            if json {
                builder.json().try_init().is_ok()
            } else {
                builder.try_init().is_ok()
            }
        }
        None if json => builder.json().try_init().is_ok(),
        None => builder.try_init().is_ok(),
    };
    Ok(installed)
}
