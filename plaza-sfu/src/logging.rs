//! Tracing setup for the plaza binaries
//!
//! Output is switchable between pretty (development) and JSON (production
//! ingestion); an optional file sink mirrors whichever format is active.
//! `RUST_LOG` overrides the configured level so operators can raise
//! verbosity per target without touching configuration.

use std::fs::{File, OpenOptions};
use std::sync::Arc;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Install the global subscriber described by the configuration
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    validate_log_level(&config.level)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("invalid log filter {:?}: {e}", config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let sink = config.file_path.as_deref().map(open_log_file).transpose()?;

    if config.format.as_str() == "json" {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        match sink {
            Some(file) => registry.with(layer.with_writer(file)).init(),
            None => registry.with(layer).init(),
        }
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false);
        match sink {
            Some(file) => registry.with(layer.with_writer(file)).init(),
            None => registry.with(layer).init(),
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

/// Reject levels the filter would silently treat as a target name
fn validate_log_level(level: &str) -> anyhow::Result<()> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "warning" | "error" => Ok(()),
        other => Err(anyhow::anyhow!("invalid log level: {other}")),
    }
}
