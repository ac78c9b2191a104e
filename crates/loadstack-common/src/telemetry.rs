//! Logging initialization
//!
//! Two layers on one registry:
//! - console output, text or JSON, filtered by `RUST_LOG` (default `info`)
//! - a JSON per-run log file at debug level, when a path is given

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The per-run log file could not be created
    #[error("failed to create log file {path}: {source}")]
    LogFile {
        /// Path that could not be created
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for logging initialization
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Per-run JSON log file
    pub log_file: Option<PathBuf>,
    /// Emit console logs as JSON lines instead of text
    pub json_console: bool,
}

/// Install the global subscriber.
///
/// # Example
///
/// ```ignore
/// use loadstack_common::telemetry::{init_logging, LoggingConfig};
///
/// init_logging(LoggingConfig {
///     log_file: Some(workspace.log_path()),
///     json_console: false,
/// })?;
/// ```
pub fn init_logging(config: LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console: Box<dyn Layer<Registry> + Send + Sync> = if config.json_console {
        fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = File::create(path).map_err(|source| TelemetryError::LogFile {
                path: path.clone(),
                source,
            })?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console.with_filter(env_filter))
        .with(file_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}
