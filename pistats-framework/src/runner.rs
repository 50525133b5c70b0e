//! Service runner for lifecycle management.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pistats_common::init_tracing;

use crate::ServiceArgs;
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type WorkerHandle = JoinHandle<std::result::Result<(), String>>;

/// Service runner that manages the lifecycle of a long-running pistats program.
///
/// Handles:
/// - Logging initialization (with optional CLI level override)
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C or SIGTERM through a shared [`CancellationToken`]
/// - A bounded grace period for workers to finish their cleanup
///
/// # Example
///
/// ```ignore
/// use pistats_framework::{ServiceArgs, ServiceConfig, ServiceRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = ServiceArgs::parse();
///     let config = MyConfig::load_or_default(args.config.as_deref(), "my.json5")?;
///
///     let mut runner = ServiceRunner::new("my-service", config, Some(&args))?;
///     let cancel = runner.cancel_token();
///     runner.spawn("worker", async move {
///         cancel.cancelled().await;
///     });
///
///     runner.run().await?;
///     Ok(())
/// }
/// ```
pub struct ServiceRunner<C: ServiceConfig> {
    /// Service name for logging.
    name: String,
    /// Service version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Cancelled when shutdown begins.
    cancel: CancellationToken,
    /// How long workers get to finish after cancellation.
    shutdown_grace: Duration,
    /// Spawned tasks.
    tasks: Vec<(String, WorkerHandle)>,
}

impl<C: ServiceConfig> ServiceRunner<C> {
    /// Create a new service runner.
    ///
    /// Initializes logging from the configuration, with `--log-level`
    /// taking precedence when present in `args`.
    pub fn new(name: impl Into<String>, mut config: C, args: Option<&ServiceArgs>) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        if let Some(level) = args.and_then(|a| a.log_level.clone()) {
            config.logging_mut().level = level;
        }

        init_tracing(config.logging()).map_err(|e| ServiceError::config(e.to_string()))?;

        tracing::info!(service = %name, version = %version, "Starting service");

        Ok(Self::without_tracing(name, version, config))
    }

    fn without_tracing(name: String, version: String, config: C) -> Self {
        Self {
            name,
            version,
            config,
            cancel: CancellationToken::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            tasks: Vec::new(),
        }
    }

    /// Set how long workers may take to finish after shutdown begins.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Get the service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the service version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Token observed by workers; cancelled once shutdown starts.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a worker task.
    ///
    /// Workers should watch [`cancel_token`](Self::cancel_token) and return
    /// once it fires. Workers still running after the grace period are aborted.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            future.await;
            Ok(())
        });
        self.tasks.push((name.into(), handle));
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// A failing worker is logged and triggers shutdown of the whole service;
    /// [`run`](Self::run) then returns [`ServiceError::Worker`].
    pub fn spawn_with_error<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let worker = name.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            future.await.map_err(|e| {
                tracing::error!(worker = %worker, error = %e, "Worker failed");
                cancel.cancel();
                e.to_string()
            })
        });
        self.tasks.push((name, handle));
    }

    /// Run the service until a shutdown signal arrives or a worker fails.
    ///
    /// This will:
    /// 1. Wait for Ctrl+C, SIGTERM, or cancellation by a failed worker
    /// 2. Cancel the shared token
    /// 3. Wait up to the grace period for workers to finish
    /// 4. Abort any worker still running
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            service = %self.name,
            tasks = self.tasks.len(),
            "Service running. Press Ctrl+C to stop."
        );

        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!(service = %self.name, "Received shutdown signal");
            }
            _ = self.cancel.cancelled() => {
                tracing::info!(service = %self.name, "Shutdown requested");
            }
        }

        self.shutdown().await
    }

    async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();

        let deadline = Instant::now() + self.shutdown_grace;
        let mut failures = Vec::new();

        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => failures.push(format!("{}: {}", name, e)),
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(worker = %name, "Worker panicked");
                    failures.push(format!("{}: panicked", name));
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(worker = %name, "Worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        tracing::info!(service = %self.name, "Goodbye!");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::worker(failures.join("; ")))
        }
    }
}

/// Resolve once Ctrl+C or (on Unix) SIGTERM is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
