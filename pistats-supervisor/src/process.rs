//! Broadcaster process control.
//!
//! The broadcaster is recognized by a substring of its command line, so an
//! instance started by hand or by a previous supervisor run is found and
//! stopped just like one this process launched.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;

/// Process control errors.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` was not running {settle_secs}s after launch")]
    NotRunning { command: String, settle_secs: u64 },
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A matching process was already running; nothing was launched.
    AlreadyRunning,
    /// A new process was launched and confirmed running.
    Started,
}

/// Start, stop and query the broadcaster.
pub trait ProcessControl: Send + Sync {
    /// Whether any process matching the broadcaster signature exists.
    fn is_running(&self) -> impl Future<Output = bool> + Send;

    /// Launch the broadcaster unless one is already running.
    fn start(&mut self) -> impl Future<Output = Result<StartOutcome, ProcessError>> + Send;

    /// Terminate every matching process. Safe to call when nothing runs.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;
}

/// Controls the broadcaster as an OS process.
pub struct ProcessController {
    config: ProcessConfig,
    child: Option<Child>,
}

impl ProcessController {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    /// Whether this controller holds a launched child handle.
    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    async fn matching(&self) -> Vec<Pid> {
        let signature = self.config.signature.clone();
        tokio::task::spawn_blocking(move || {
            let system = process_table();
            matching_pids(&system, &signature)
        })
        .await
        .unwrap_or_default()
    }

    /// Release the child handle if it has already exited.
    fn reap_exited(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("Broadcaster exited with {}", status);
                self.child = None;
            }
            Ok(None) => {}
            Err(e) => debug!("Failed to poll broadcaster status: {}", e),
        }
    }
}

impl ProcessControl for ProcessController {
    async fn is_running(&self) -> bool {
        !self.matching().await.is_empty()
    }

    async fn start(&mut self) -> Result<StartOutcome, ProcessError> {
        if self.is_running().await {
            info!("Broadcaster already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group, so stop() can signal the whole tree.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        info!(pid = child.id(), "Launched {}", self.config.command);
        self.child = Some(child);

        tokio::time::sleep(self.config.settle()).await;

        if self.is_running().await {
            info!("Broadcaster started");
            Ok(StartOutcome::Started)
        } else {
            self.reap_exited();
            Err(ProcessError::NotRunning {
                command: self.config.command.clone(),
                settle_secs: self.config.settle_secs,
            })
        }
    }

    async fn stop(&mut self) {
        let signature = self.config.signature.clone();
        let signalled = tokio::task::spawn_blocking(move || terminate_matching(&signature))
            .await
            .unwrap_or(0);
        if signalled > 0 {
            debug!("Sent SIGTERM to {} matching process(es)", signalled);
        }

        if let Some(child) = self.child.take() {
            terminate_group(child, self.config.stop_timeout()).await;
        }

        info!("Broadcaster stopped");
    }
}

fn process_table() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    system
}

/// Pids whose command line contains `signature`, excluding this process
/// and its threads.
fn matching_pids(system: &System, signature: &str) -> Vec<Pid> {
    let own = sysinfo::get_current_pid().ok();

    system
        .processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != own)
        .filter(|(_, process)| process.thread_kind().is_none())
        .filter(|(_, process)| {
            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            cmdline_matches(&cmdline, signature)
        })
        .map(|(pid, _)| *pid)
        .collect()
}

/// Whether a full command line identifies the broadcaster.
pub fn cmdline_matches(cmdline: &str, signature: &str) -> bool {
    !signature.is_empty() && cmdline.contains(signature)
}

/// SIGTERM every matching process. Returns how many were signalled.
fn terminate_matching(signature: &str) -> usize {
    let system = process_table();
    matching_pids(&system, signature)
        .into_iter()
        .filter_map(|pid| system.process(pid))
        .filter(|process| process.kill_with(Signal::Term).unwrap_or_else(|| process.kill()))
        .count()
}

/// Terminate a launched child's process group, escalating to SIGKILL.
#[cfg(unix)]
async fn terminate_group(mut child: Child, grace: Duration) {
    use nix::sys::signal::{Signal as NixSignal, killpg};
    use nix::unistd::Pid as NixPid;

    // Already reaped.
    let Some(pid) = child.id() else {
        return;
    };
    let group = NixPid::from_raw(pid as i32);

    if let Err(e) = killpg(group, NixSignal::SIGTERM) {
        debug!("SIGTERM to process group {} failed: {}", pid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Broadcaster process {} exited with {}", pid, status),
        Ok(Err(e)) => warn!("Failed to wait for broadcaster process {}: {}", pid, e),
        Err(_) => {
            warn!(
                "Broadcaster process group {} ignored SIGTERM for {}s, killing",
                pid,
                grace.as_secs()
            );
            if let Err(e) = killpg(group, NixSignal::SIGKILL) {
                debug!("SIGKILL to process group {} failed: {}", pid, e);
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_group(mut child: Child, grace: Duration) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill broadcaster: {}", e);
    }
    let _ = tokio::time::timeout(grace, child.wait()).await;
}

/// Locate the broadcaster executable: an existing path, or a name found
/// on `PATH`.
pub fn resolve_command(command: &str) -> Option<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}
