//! pistats Common Library
//!
//! Shared types and utilities for the pistats broadcaster and supervisor:
//!
//! - [`snapshot`] - Telemetry snapshot data model (`TelemetrySnapshot`, `SystemStats`)
//! - [`serialization`] - JSON encoding and decoding
//! - [`config`] - Logging settings
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod serialization;
pub mod snapshot;

use std::fs::{File, OpenOptions};
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::registry::LookupSpan;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use serialization::{decode, encode};
pub use snapshot::{SystemStats, TelemetrySnapshot, Turbidity, local_timestamp};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// When `config.file` is set, every event is also appended to that file
/// without ANSI colouring.
///
/// # Example
///
/// ```ignore
/// use pistats_common::{LoggingConfig, init_tracing};
///
/// init_tracing(&LoggingConfig::with_file("pistats-supervisor.log"))?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file = match &config.file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::Config(format!(
                        "Failed to open log file '{}': {}",
                        path.display(),
                        e
                    ))
                })?,
        ),
        None => None,
    };

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(file_layer(file))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(file_layer(file))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}

fn file_layer<S>(file: Option<File>) -> Option<Box<dyn Layer<S> + Send + Sync + 'static>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .boxed()
    })
}
