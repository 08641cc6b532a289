use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{Error, Result};

/// Initialize logging to stderr.
///
/// `level` is an `EnvFilter` directive such as `"info"` or
/// `"shardmc_core=debug"`; `RUST_LOG` overrides it. Fails if a global
/// subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing::debug!(level, "logging initialized");
    Ok(())
}
