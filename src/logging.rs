//! Structured logging setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::kernel::ConfigError;

/// Installs a global `fmt` subscriber filtered by `level`, an `EnvFilter` directive such
/// as `"info"` or `"sombra_kernel::kernel=debug"`.
pub fn init_logging(level: &str) -> Result<(), ConfigError> {
    let filter =
        EnvFilter::try_new(level).map_err(|e| ConfigError::InvalidLogLevel(e.to_string()))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| ConfigError::LoggingAlreadyInitialized)
}
