//! Configuration for the connectivity supervisor.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use pistats_framework::{LoggingConfig, Result, ServiceConfig, ServiceError};

/// Default event log written next to the supervisor.
pub const DEFAULT_LOG_FILE: &str = "pistats-supervisor.log";

/// Complete supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Interface whose connectivity gates the broadcaster (default: wlan0).
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Seconds between connectivity checks (default: 5).
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Connectivity probe targets.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// How to launch and recognize the broadcaster.
    #[serde(default)]
    pub broadcaster: ProcessConfig,

    /// Logging configuration. Appends to `pistats-supervisor.log` unless
    /// the section is given explicitly.
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            check_interval_secs: default_check_interval(),
            probe: ProbeConfig::default(),
            broadcaster: ProcessConfig::default(),
            logging: default_logging(),
        }
    }
}

impl ServiceConfig for SupervisorConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn logging_mut(&mut self) -> &mut LoggingConfig {
        &mut self.logging
    }

    fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(ServiceError::validation("interface must not be empty"));
        }
        if self.check_interval_secs == 0 {
            return Err(ServiceError::validation("check_interval_secs must be > 0"));
        }
        if self.probe.internet_timeout_secs == 0 {
            return Err(ServiceError::validation(
                "probe.internet_timeout_secs must be > 0",
            ));
        }
        if self.broadcaster.command.is_empty() {
            return Err(ServiceError::validation(
                "broadcaster.command must not be empty",
            ));
        }
        if self.broadcaster.signature.is_empty() {
            return Err(ServiceError::validation(
                "broadcaster.signature must not be empty",
            ));
        }
        Ok(())
    }
}

fn default_interface() -> String {
    "wlan0".to_string()
}

fn default_check_interval() -> u64 {
    5
}

fn default_logging() -> LoggingConfig {
    LoggingConfig::with_file(DEFAULT_LOG_FILE)
}

/// External endpoints used to judge connectivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Address the UDP route probe "connects" to; no packet is sent.
    #[serde(default = "default_route_target")]
    pub route_target: String,

    /// TCP endpoint whose reachability means internet access.
    #[serde(default = "default_internet_target")]
    pub internet_target: String,

    /// Connect timeout for the internet probe (default: 3).
    #[serde(default = "default_internet_timeout")]
    pub internet_timeout_secs: u64,
}

impl ProbeConfig {
    pub fn internet_timeout(&self) -> Duration {
        Duration::from_secs(self.internet_timeout_secs)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            route_target: default_route_target(),
            internet_target: default_internet_target(),
            internet_timeout_secs: default_internet_timeout(),
        }
    }
}

fn default_route_target() -> String {
    "8.8.8.8:80".to_string()
}

fn default_internet_target() -> String {
    "8.8.8.8:53".to_string()
}

fn default_internet_timeout() -> u64 {
    3
}

/// Broadcaster launch and identification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Executable to launch (path or name on PATH).
    #[serde(default = "default_command")]
    pub command: String,

    /// Extra arguments passed to the broadcaster.
    #[serde(default)]
    pub args: Vec<String>,

    /// Substring of a process command line that identifies the broadcaster.
    #[serde(default = "default_signature")]
    pub signature: String,

    /// Seconds to wait after launch before confirming it runs (default: 2).
    #[serde(default = "default_settle")]
    pub settle_secs: u64,

    /// Seconds a launched process group gets to exit after SIGTERM (default: 5).
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl ProcessConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            signature: default_signature(),
            settle_secs: default_settle(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

fn default_command() -> String {
    "pistats-broadcaster".to_string()
}

fn default_signature() -> String {
    "pistats-broadcaster".to_string()
}

fn default_settle() -> u64 {
    2
}

fn default_stop_timeout() -> u64 {
    5
}
