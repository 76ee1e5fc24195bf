use crate::error::{Result, TansuError};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialises the global tracing subscriber.
///
/// `level` accepts anything `EnvFilter` understands, e.g. `"info"` or
/// `"tansu=debug"`. Returns an error if the filter is invalid or a
/// subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| TansuError::InvalidArgument(format!("Invalid log level: {e}")))?,
        )
        .with_target(true)
        .try_init()
        .map_err(|_| TansuError::InvalidArgument("Logging already initialized".into()))
}
