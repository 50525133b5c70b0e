//! pistats Service Framework
//!
//! Common lifecycle plumbing for the long-running pistats programs.
//!
//! # Overview
//!
//! This framework provides:
//! - [`ServiceConfig`] trait for configuration loading, defaults and validation
//! - [`ServiceRunner`] for managing service lifecycle (logging, workers, signal handling)
//! - [`ServiceArgs`] for common CLI argument parsing
//! - [`shutdown_signal`] for waiting on Ctrl+C / SIGTERM
//!
//! # Example
//!
//! ```ignore
//! use pistats_framework::{ServiceArgs, ServiceConfig, ServiceRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = ServiceArgs::parse();
//!     let config = MyConfig::load_or_default(args.config.as_deref(), "my.json5")?;
//!
//!     let mut runner = ServiceRunner::new("my-service", config, Some(&args))?;
//!     runner.spawn("worker", my_worker(runner.cancel_token()));
//!
//!     // Run until Ctrl+C or SIGTERM
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
mod runner;

pub use args::ServiceArgs;
pub use config::ServiceConfig;
pub use error::{Result, ServiceError};
pub use runner::{ServiceRunner, shutdown_signal};

// Re-export commonly used types
pub use pistats_common::{LogFormat, LoggingConfig};
pub use tokio_util::sync::CancellationToken;
