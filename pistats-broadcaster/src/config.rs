//! Configuration for the telemetry broadcaster.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use pistats_framework::{LoggingConfig, Result, ServiceConfig, ServiceError};

/// Complete broadcaster configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// WebSocket server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// System metrics collection settings.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Water and ambient sensor settings.
    #[serde(default)]
    pub sensors: SensorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BroadcasterConfig {
    /// Time allowed for shutdown: an in-flight collection plus the
    /// subscriber close drain.
    pub fn shutdown_grace(&self) -> Duration {
        self.collector.timeout() + self.server.keepalive().close_timeout + Duration::from_secs(1)
    }
}

impl ServiceConfig for BroadcasterConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn logging_mut(&mut self) -> &mut LoggingConfig {
        &mut self.logging
    }

    fn validate(&self) -> Result<()> {
        if self.server.broadcast_interval_ms == 0 {
            return Err(ServiceError::validation(
                "server.broadcast_interval_ms must be > 0",
            ));
        }
        if self.server.ping_interval_secs == 0 {
            return Err(ServiceError::validation(
                "server.ping_interval_secs must be > 0",
            ));
        }
        if self.server.ping_timeout_secs == 0 {
            return Err(ServiceError::validation(
                "server.ping_timeout_secs must be > 0",
            ));
        }
        if self.server.close_timeout_secs == 0 {
            return Err(ServiceError::validation(
                "server.close_timeout_secs must be > 0",
            ));
        }
        if self.server.subscriber_buffer == 0 {
            return Err(ServiceError::validation(
                "server.subscriber_buffer must be > 0",
            ));
        }
        if self.server.max_subscribers == 0 {
            return Err(ServiceError::validation(
                "server.max_subscribers must be > 0",
            ));
        }
        if self.collector.timeout_ms == 0 {
            return Err(ServiceError::validation("collector.timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind (default: all interfaces).
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind (default: 8765).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Snapshot period in milliseconds (default: 1000).
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,

    /// Seconds between keep-alive pings (default: 20).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the subscriber (default: 10).
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Seconds allowed for the closing handshake (default: 10).
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,

    /// Maximum simultaneous subscribers (default: 64).
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,

    /// Pending frames buffered per subscriber before ticks are skipped (default: 8).
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn keepalive(&self) -> KeepAlive {
        KeepAlive {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            broadcast_interval_ms: default_broadcast_interval(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            close_timeout_secs: default_close_timeout(),
            max_subscribers: default_max_subscribers(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Keep-alive timings applied to every subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub close_timeout: Duration,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_broadcast_interval() -> u64 {
    1000
}

fn default_ping_interval() -> u64 {
    20
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_close_timeout() -> u64 {
    10
}

fn default_max_subscribers() -> usize {
    64
}

fn default_subscriber_buffer() -> usize {
    8
}

/// System metrics collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Number of top processes to report (default: 10).
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,

    /// Upper bound on a single collection in milliseconds (default: 2000).
    #[serde(default = "default_collect_timeout")]
    pub timeout_ms: u64,

    /// Network interface filters.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Disk mount filters.
    #[serde(default)]
    pub disk: DiskConfig,
}

impl CollectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            top_processes: default_top_processes(),
            timeout_ms: default_collect_timeout(),
            network: NetworkConfig::default(),
            disk: DiskConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_top_processes() -> usize {
    10
}

fn default_collect_timeout() -> u64 {
    2000
}

/// Network interface filtering configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Only include these interfaces (empty = include all).
    #[serde(default)]
    pub include: Vec<String>,

    /// Exclude these interfaces.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Exclude virtual interfaces (docker, veth, etc.) (default: false).
    #[serde(default)]
    pub exclude_virtual: bool,
}

/// Disk mount filtering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Only include these mount points (empty = include all).
    #[serde(default)]
    pub include: Vec<String>,

    /// Exclude these mount points.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Exclude pseudo filesystems (tmpfs, devtmpfs, etc.) (default: true).
    #[serde(default = "default_true")]
    pub exclude_pseudo: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            exclude_pseudo: true,
        }
    }
}

/// Whether to read the GPIO sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Probe the GPIO pins at startup and simulate if they are unusable.
    #[default]
    Auto,
    /// Require the GPIO pins; startup fails without them.
    Enabled,
    /// Always simulate.
    Disabled,
}

/// Water and ambient sensor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub hardware: HardwareMode,

    /// Root of the sysfs GPIO tree.
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,

    /// Offset added to BCM pin numbers (non-zero on newer kernels, e.g. 512).
    #[serde(default)]
    pub gpio_base: u32,

    /// Ultrasonic trigger pin (BCM, default: 23).
    #[serde(default = "default_trig_pin")]
    pub trig_pin: u32,

    /// Ultrasonic echo pin (BCM, default: 24).
    #[serde(default = "default_echo_pin")]
    pub echo_pin: u32,

    /// Turbidity digital output pin (BCM, default: 17).
    #[serde(default = "default_turbidity_pin")]
    pub turbidity_pin: u32,

    /// Maximum wait for an ultrasonic echo edge in milliseconds (default: 1000).
    #[serde(default = "default_echo_timeout")]
    pub echo_timeout_ms: u64,

    /// Thermal zone file read for ambient temperature.
    #[serde(default = "default_thermal_zone")]
    pub thermal_zone: PathBuf,

    /// Calibration offset subtracted from the thermal zone reading (default: 15.5).
    #[serde(default = "default_ambient_offset")]
    pub ambient_offset_celsius: f64,

    /// Optional Arduino providing pH and analog turbidity over serial.
    #[serde(default)]
    pub arduino: Option<ArduinoConfig>,
}

impl SensorConfig {
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            hardware: HardwareMode::default(),
            gpio_root: default_gpio_root(),
            gpio_base: 0,
            trig_pin: default_trig_pin(),
            echo_pin: default_echo_pin(),
            turbidity_pin: default_turbidity_pin(),
            echo_timeout_ms: default_echo_timeout(),
            thermal_zone: default_thermal_zone(),
            ambient_offset_celsius: default_ambient_offset(),
            arduino: None,
        }
    }
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_trig_pin() -> u32 {
    23
}

fn default_echo_pin() -> u32 {
    24
}

fn default_turbidity_pin() -> u32 {
    17
}

fn default_echo_timeout() -> u64 {
    1000
}

fn default_thermal_zone() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

fn default_ambient_offset() -> f64 {
    15.5
}

/// Serial link to an Arduino emitting `{"ph": .., "turbidity": ..}` lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArduinoConfig {
    /// Serial device (default: /dev/ttyACM0).
    #[serde(default = "default_arduino_port")]
    pub port: String,

    /// Baud rate (default: 9600).
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Readings older than this are ignored (default: 10).
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_arduino_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_max_age() -> u64 {
    10
}

impl NetworkConfig {
    /// Check if an interface should be included.
    pub fn should_include(&self, name: &str) -> bool {
        // Check explicit include list
        if !self.include.is_empty() && !self.include.iter().any(|i| i == name) {
            return false;
        }

        // Check exclude list
        if self.exclude.iter().any(|e| e == name) {
            return false;
        }

        // Check virtual interfaces
        if self.exclude_virtual {
            let virtual_prefixes = ["docker", "veth", "br-", "virbr", "vnet"];
            if virtual_prefixes.iter().any(|p| name.starts_with(p)) {
                return false;
            }
        }

        true
    }
}

impl DiskConfig {
    /// Check if a mount point should be included.
    pub fn should_include(&self, mount_point: &str, fs_type: &str) -> bool {
        // Check explicit include list
        if !self.include.is_empty() && !self.include.iter().any(|i| i == mount_point) {
            return false;
        }

        // Check exclude list
        if self.exclude.iter().any(|e| e == mount_point) {
            return false;
        }

        // Check pseudo filesystems
        if self.exclude_pseudo {
            let pseudo_types = [
                "tmpfs",
                "devtmpfs",
                "devfs",
                "sysfs",
                "proc",
                "cgroup",
                "cgroup2",
                "securityfs",
                "debugfs",
                "configfs",
                "fusectl",
                "hugetlbfs",
                "mqueue",
                "pstore",
                "binfmt_misc",
                "autofs",
                "squashfs",
            ];
            if pseudo_types.iter().any(|t| *t == fs_type) {
                return false;
            }
        }

        true
    }
}
