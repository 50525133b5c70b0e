//! Telemetry snapshot data model.
//!
//! One [`TelemetrySnapshot`] is produced per broadcast tick and serialized once
//! as a JSON object. When collection fails the object degrades to
//! `{ "timestamp": ..., "error": ... }`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One telemetry record, either fully populated or an error descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetrySnapshot {
    /// Complete system and sensor statistics.
    Stats(Box<SystemStats>),
    /// Collection failed; only a timestamp and the failure reason are sent.
    Error(SnapshotError),
}

impl TelemetrySnapshot {
    /// Build an error snapshot stamped with the current local time.
    pub fn error(message: impl Into<String>) -> Self {
        TelemetrySnapshot::Error(SnapshotError {
            timestamp: local_timestamp(),
            error: message.into(),
        })
    }

    /// ISO-8601 timestamp of this snapshot.
    pub fn timestamp(&self) -> &str {
        match self {
            TelemetrySnapshot::Stats(stats) => &stats.timestamp,
            TelemetrySnapshot::Error(err) => &err.timestamp,
        }
    }

    /// Whether this snapshot is the degraded error form.
    pub fn is_error(&self) -> bool {
        matches!(self, TelemetrySnapshot::Error(_))
    }

    /// The full statistics, if collection succeeded.
    pub fn stats(&self) -> Option<&SystemStats> {
        match self {
            TelemetrySnapshot::Stats(stats) => Some(stats),
            TelemetrySnapshot::Error(_) => None,
        }
    }
}

impl From<SystemStats> for TelemetrySnapshot {
    fn from(stats: SystemStats) -> Self {
        TelemetrySnapshot::Stats(Box::new(stats))
    }
}

/// Degraded snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotError {
    pub timestamp: String,
    pub error: String,
}

/// Full statistics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub timestamp: String,
    pub system: SystemGroup,
    pub cpu: CpuGroup,
    pub memory: MemoryGroup,
    pub swap: SwapGroup,
    pub disk: DiskGroup,
    pub network: NetworkGroup,
    pub processes: ProcessGroup,
    pub temperature: TemperatureGroup,
    pub custom_sensors: CustomSensors,
    pub battery: Option<Battery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemGroup {
    pub boot_time: String,
    pub uptime_seconds: f64,
    /// Uptime as `H:MM:SS`, prefixed with a day count when over 24 hours.
    pub uptime_human: String,
    /// 1, 5 and 15 minute load averages; `None` on platforms without them.
    pub load_average: Option<Vec<f64>>,
    pub connected_clients: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuGroup {
    pub usage_percent: f64,
    pub count_physical: Option<usize>,
    pub count_logical: usize,
    pub frequency_mhz: CpuFrequency,
    pub per_core_usage: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuFrequency {
    pub current: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryGroup {
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub used_percent: f64,
    pub cached_gb: Option<f64>,
    pub buffers_gb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapGroup {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskGroup {
    pub root_usage_percent: Option<f64>,
    pub partitions: Vec<Partition>,
    pub io_counters: DiskIoCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub used_percent: f64,
}

/// Cumulative block device counters, summed over whole disks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskIoCounters {
    pub read_count: Option<u64>,
    pub write_count: Option<u64>,
    pub read_bytes: Option<u64>,
    pub write_bytes: Option<u64>,
    /// Milliseconds spent reading.
    pub read_time: Option<u64>,
    /// Milliseconds spent writing.
    pub write_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkGroup {
    pub io_counters: NetworkIoCounters,
    pub interfaces: BTreeMap<String, InterfaceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIoCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: Option<u64>,
    pub dropout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// "AF_INET" or "AF_INET6".
    pub family: String,
    pub address: String,
    pub netmask: Option<String>,
    pub broadcast: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub total_count: usize,
    /// Highest CPU consumers first, at most the configured limit.
    pub top_cpu_usage: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureGroup {
    pub pi_cpu_celsius: Option<f64>,
    /// Readings keyed by hwmon chip name.
    pub sensors: BTreeMap<String, Vec<TemperatureSensor>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSensor {
    pub label: String,
    pub current: f64,
    pub high: Option<f64>,
    pub critical: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomSensors {
    pub ambient_temp_celsius: Option<f64>,
    pub ultrasonic_distance_cm: Option<f64>,
    pub water_turbidity: Option<Turbidity>,
    pub ph_level: Option<f64>,
    /// True when readings come from real hardware rather than simulation.
    pub gpio_available: bool,
    /// Analog turbidity value from an attached Arduino, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turbidity_raw: Option<f64>,
}

/// Digital turbidity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Turbidity {
    Clear,
    Turbid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub percent: f64,
    pub power_plugged: Option<bool>,
    /// Seconds of charge left; `None` while charging or unknown.
    pub secsleft: Option<u64>,
}

/// Current local time as ISO-8601 with microsecond precision.
pub fn local_timestamp() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Convert bytes to gigabytes (1024³), rounded to two decimals.
pub fn bytes_to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / BYTES_PER_GB)
}

/// `part / total` as a rounded percentage, 0 when `total` is 0.
pub fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(part as f64 / total as f64 * 100.0)
}

/// Format an uptime in seconds as `H:MM:SS` or `N day(s), H:MM:SS`.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    let clock = format!("{}:{:02}:{:02}", hours, minutes, secs);

    match days {
        0 => clock,
        1 => format!("1 day, {}", clock),
        n => format!("{} days, {}", n, clock),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0:00:00");
        assert_eq!(format_uptime(3_725), "1:02:05");
        assert_eq!(format_uptime(86_400), "1 day, 0:00:00");
        assert_eq!(format_uptime(2 * 86_400 + 59), "2 days, 0:00:59");
    }

    #[test]
    fn test_unit_helpers() {
        assert_eq!(bytes_to_gb(1024 * 1024 * 1024), 1.0);
        assert_eq!(bytes_to_gb(0), 0.0);
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(round2(6.999), 7.0);
    }

    #[test]
    fn test_error_snapshot_shape() {
        let snapshot = TelemetrySnapshot::error("sensor bus offline");
        let value = serde_json::to_value(&snapshot).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), 2);
        assert_eq!(object["error"], "sensor bus offline");
        assert!(object["timestamp"].is_string());
        assert!(snapshot.is_error());
        assert!(snapshot.stats().is_none());
    }

    #[test]
    fn test_turbidity_serializes_as_label() {
        assert_eq!(
            serde_json::to_string(&Turbidity::Clear).unwrap(),
            "\"Clear\""
        );
        assert_eq!(
            serde_json::from_str::<Turbidity>("\"Turbid\"").unwrap(),
            Turbidity::Turbid
        );
    }

    #[test]
    fn test_turbidity_raw_omitted_when_absent() {
        let sensors = CustomSensors {
            ambient_temp_celsius: Some(24.1),
            ultrasonic_distance_cm: None,
            water_turbidity: Some(Turbidity::Clear),
            ph_level: Some(7.02),
            gpio_available: false,
            turbidity_raw: None,
        };

        let value = serde_json::to_value(&sensors).unwrap();
        assert!(value.get("turbidity_raw").is_none());
        assert!(value["ultrasonic_distance_cm"].is_null());
    }
}
