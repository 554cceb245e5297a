//! Tracing setup shared by the Verdin binaries.
//!
//! `RUST_LOG` wins over the configured level when set, so operators can
//! raise verbosity per target without touching the config file.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output style for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for terminals.
    Text,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Install the global subscriber.
pub fn init(level: &str, format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .init(),
    }
    Ok(())
}

/// Text logging, the default for interactive runs.
pub fn init_logging(level: &str) -> Result<()> {
    init(level, LogFormat::Text)
}

/// JSON logging for aggregated environments.
pub fn init_logging_json(level: &str) -> Result<()> {
    init(level, LogFormat::Json)
}
