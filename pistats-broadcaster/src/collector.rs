//! Telemetry collection using sysinfo.
//!
//! [`SystemCollector`] assembles one [`SystemStats`] record per call from
//! sysinfo, the Linux procfs/sysfs readers and the [`SensorSuite`].
//! [`GuardedCollector`] runs a collector on the blocking pool under a timeout
//! and turns every failure into an error snapshot, so the broadcast loop
//! never has to handle one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use if_addrs::IfAddr;
use parking_lot::Mutex;
use sysinfo::{Disks, Networks, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use pistats_common::snapshot::{
    CpuFrequency, CpuGroup, DiskGroup, InterfaceAddress, InterfaceInfo,
    MemoryGroup, NetworkGroup, NetworkIoCounters, Partition, ProcessEntry, ProcessGroup,
    SwapGroup, SystemGroup, TemperatureGroup, bytes_to_gb, format_uptime, local_timestamp,
    percent, round2,
};
use pistats_common::{SystemStats, TelemetrySnapshot};

use crate::config::CollectorConfig;
use crate::sensors::SensorSuite;

/// Produces one snapshot on demand.
///
/// Implementations may block; [`GuardedCollector`] keeps them off the
/// async runtime.
pub trait TelemetryCollector: Send + 'static {
    /// Build a snapshot. `connected_clients` is reported in the `system` group.
    fn collect(&mut self, connected_clients: usize) -> TelemetrySnapshot;
}

/// Collector for the host's system metrics and custom sensors.
pub struct SystemCollector {
    system: System,
    disks: Disks,
    networks: Networks,
    config: CollectorConfig,
    sensors: SensorSuite,
}

impl SystemCollector {
    pub fn new(config: CollectorConfig, sensors: SensorSuite) -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            config,
            sensors,
        }
    }

    fn collect_stats(&mut self, connected_clients: usize) -> SystemStats {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        self.disks.refresh(true);
        self.networks.refresh(true);

        let stats = SystemStats {
            timestamp: local_timestamp(),
            system: self.system_group(connected_clients),
            cpu: self.cpu_group(),
            memory: self.memory_group(),
            swap: self.swap_group(),
            disk: self.disk_group(),
            network: self.network_group(),
            processes: self.process_group(),
            temperature: temperature_group(),
            custom_sensors: self.sensors.read(),
            battery: platform::battery(),
        };

        debug!(
            processes = stats.processes.total_count,
            partitions = stats.disk.partitions.len(),
            "Collected snapshot"
        );

        stats
    }

    fn system_group(&self, connected_clients: usize) -> SystemGroup {
        let boot = System::boot_time();
        let uptime = System::uptime();

        let boot_time = chrono::DateTime::from_timestamp(boot as i64, 0)
            .map(|t| t.with_timezone(&chrono::Local).to_rfc3339())
            .unwrap_or_default();

        let load_average = if cfg!(unix) {
            let load = System::load_average();
            Some(vec![
                round2(load.one),
                round2(load.five),
                round2(load.fifteen),
            ])
        } else {
            None
        };

        SystemGroup {
            boot_time,
            uptime_seconds: uptime as f64,
            uptime_human: format_uptime(uptime),
            load_average,
            connected_clients,
        }
    }

    fn cpu_group(&self) -> CpuGroup {
        let cpus = self.system.cpus();

        let current = cpus
            .first()
            .map(|cpu| cpu.frequency())
            .filter(|mhz| *mhz > 0)
            .map(|mhz| mhz as f64);
        let (min, max) = platform::cpu_frequency_limits();

        CpuGroup {
            usage_percent: round2(self.system.global_cpu_usage() as f64),
            count_physical: self.system.physical_core_count(),
            count_logical: cpus.len(),
            frequency_mhz: CpuFrequency { current, min, max },
            per_core_usage: cpus
                .iter()
                .map(|cpu| round2(cpu.cpu_usage() as f64))
                .collect(),
        }
    }

    fn memory_group(&self) -> MemoryGroup {
        let total = self.system.total_memory();
        let available = self.system.available_memory();
        let (cached, buffers) = match platform::cached_and_buffers() {
            Some((cached, buffers)) => (Some(bytes_to_gb(cached)), Some(bytes_to_gb(buffers))),
            None => (None, None),
        };

        MemoryGroup {
            total_gb: bytes_to_gb(total),
            available_gb: bytes_to_gb(available),
            used_gb: bytes_to_gb(self.system.used_memory()),
            free_gb: bytes_to_gb(self.system.free_memory()),
            used_percent: percent(total.saturating_sub(available), total),
            cached_gb: cached,
            buffers_gb: buffers,
        }
    }

    fn swap_group(&self) -> SwapGroup {
        let total = self.system.total_swap();
        let used = self.system.used_swap();

        SwapGroup {
            total_gb: bytes_to_gb(total),
            used_gb: bytes_to_gb(used),
            free_gb: bytes_to_gb(self.system.free_swap()),
            used_percent: percent(used, total),
        }
    }

    fn disk_group(&self) -> DiskGroup {
        let mut partitions = Vec::new();
        let mut root_usage_percent = None;

        for disk in self.disks.list() {
            let mountpoint = disk.mount_point().to_string_lossy().to_string();
            let fstype = disk.file_system().to_string_lossy().to_string();

            if !self.config.disk.should_include(&mountpoint, &fstype) {
                continue;
            }

            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);
            let used_percent = percent(used, total);

            if mountpoint == "/" {
                root_usage_percent = Some(used_percent);
            }

            partitions.push(Partition {
                device: disk.name().to_string_lossy().to_string(),
                mountpoint,
                fstype,
                total_gb: bytes_to_gb(total),
                used_gb: bytes_to_gb(used),
                free_gb: bytes_to_gb(free),
                used_percent,
            });
        }

        DiskGroup {
            root_usage_percent,
            partitions,
            io_counters: platform::disk_io_counters(),
        }
    }

    fn network_group(&self) -> NetworkGroup {
        let mut io = NetworkIoCounters::default();

        for (name, data) in self.networks.list() {
            if !self.config.network.should_include(name) {
                continue;
            }
            io.bytes_sent += data.total_transmitted();
            io.bytes_recv += data.total_received();
            io.packets_sent += data.total_packets_transmitted();
            io.packets_recv += data.total_packets_received();
            io.errin += data.total_errors_on_received();
            io.errout += data.total_errors_on_transmitted();
        }

        if let Some((dropin, dropout)) = platform::network_drops() {
            io.dropin = Some(dropin);
            io.dropout = Some(dropout);
        }

        NetworkGroup {
            io_counters: io,
            interfaces: self.interface_addresses(),
        }
    }

    fn interface_addresses(&self) -> BTreeMap<String, InterfaceInfo> {
        let mut interfaces: BTreeMap<String, InterfaceInfo> = BTreeMap::new();

        let addrs = match if_addrs::get_if_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Failed to list interface addresses: {}", e);
                return interfaces;
            }
        };

        for iface in addrs {
            if !self.config.network.should_include(&iface.name) {
                continue;
            }

            let address = match &iface.addr {
                IfAddr::V4(v4) => InterfaceAddress {
                    family: "AF_INET".to_string(),
                    address: v4.ip.to_string(),
                    netmask: Some(v4.netmask.to_string()),
                    broadcast: v4.broadcast.map(|b| b.to_string()),
                },
                IfAddr::V6(v6) => InterfaceAddress {
                    family: "AF_INET6".to_string(),
                    address: v6.ip.to_string(),
                    netmask: Some(v6.netmask.to_string()),
                    broadcast: v6.broadcast.map(|b| b.to_string()),
                },
            };

            interfaces
                .entry(iface.name.clone())
                .or_default()
                .addresses
                .push(address);
        }

        interfaces
    }

    fn process_group(&self) -> ProcessGroup {
        let total_memory = self.system.total_memory();
        let processes = self.system.processes();

        let mut entries: Vec<_> = processes.values().collect();
        entries.sort_by(|a, b| {
            b.cpu_usage()
                .partial_cmp(&a.cpu_usage())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let top_cpu_usage = entries
            .into_iter()
            .take(self.config.top_processes)
            .map(|proc| ProcessEntry {
                pid: proc.pid().as_u32(),
                name: proc.name().to_string_lossy().to_string(),
                cpu_percent: round2(proc.cpu_usage() as f64),
                memory_percent: percent(proc.memory(), total_memory),
            })
            .collect();

        ProcessGroup {
            total_count: processes.len(),
            top_cpu_usage,
        }
    }
}

impl TelemetryCollector for SystemCollector {
    fn collect(&mut self, connected_clients: usize) -> TelemetrySnapshot {
        self.collect_stats(connected_clients).into()
    }
}

fn temperature_group() -> TemperatureGroup {
    let sensors = platform::temperatures();

    // Fall back to the first hwmon reading when vcgencmd is missing.
    let pi_cpu_celsius = platform::soc_temperature().or_else(|| {
        sensors
            .get("cpu_thermal")
            .or_else(|| sensors.values().next())
            .and_then(|readings| readings.first())
            .map(|reading| reading.current)
    });

    TemperatureGroup {
        pi_cpu_celsius,
        sensors,
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::collections::BTreeMap;
    use std::path::Path;

    use pistats_common::snapshot::{Battery, DiskIoCounters, TemperatureSensor};

    use crate::linux;

    pub fn disk_io_counters() -> DiskIoCounters {
        linux::disk_io_counters()
    }

    pub fn cached_and_buffers() -> Option<(u64, u64)> {
        linux::cached_and_buffers()
    }

    pub fn network_drops() -> Option<(u64, u64)> {
        linux::network_drops()
    }

    pub fn temperatures() -> BTreeMap<String, Vec<TemperatureSensor>> {
        linux::collect_temperatures(Path::new(linux::HWMON_ROOT))
    }

    pub fn soc_temperature() -> Option<f64> {
        linux::vcgencmd_temperature()
    }

    pub fn cpu_frequency_limits() -> (Option<f64>, Option<f64>) {
        linux::cpu_frequency_limits(Path::new(linux::CPUFREQ_ROOT))
    }

    pub fn battery() -> Option<Battery> {
        linux::battery(Path::new(linux::POWER_SUPPLY_ROOT))
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::collections::BTreeMap;

    use pistats_common::snapshot::{Battery, DiskIoCounters, TemperatureSensor};

    pub fn disk_io_counters() -> DiskIoCounters {
        DiskIoCounters::default()
    }

    pub fn cached_and_buffers() -> Option<(u64, u64)> {
        None
    }

    pub fn network_drops() -> Option<(u64, u64)> {
        None
    }

    pub fn temperatures() -> BTreeMap<String, Vec<TemperatureSensor>> {
        BTreeMap::new()
    }

    pub fn soc_temperature() -> Option<f64> {
        None
    }

    pub fn cpu_frequency_limits() -> (Option<f64>, Option<f64>) {
        (None, None)
    }

    pub fn battery() -> Option<Battery> {
        None
    }
}

/// Runs a [`TelemetryCollector`] on the blocking pool with a time limit.
pub struct GuardedCollector<C> {
    inner: Arc<Mutex<C>>,
    timeout: Duration,
}

impl<C> Clone for GuardedCollector<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: TelemetryCollector> GuardedCollector<C> {
    pub fn new(collector: C, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(collector)),
            timeout,
        }
    }

    /// Collect one snapshot. Never fails: a panic, a timeout, or a
    /// collection still running from an earlier tick yields an error
    /// snapshot instead.
    pub async fn collect(&self, connected_clients: usize) -> TelemetrySnapshot {
        let inner = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || {
            let Some(mut collector) = inner.try_lock() else {
                return TelemetrySnapshot::error("previous collection still running");
            };
            collector.collect(connected_clients)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!("Telemetry collection failed: {}", e);
                TelemetrySnapshot::error(format!("collection failed: {}", e))
            }
            Err(_) => {
                warn!(
                    "Telemetry collection exceeded {}ms",
                    self.timeout.as_millis()
                );
                TelemetrySnapshot::error(format!(
                    "collection timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;
    use crate::sensors::SimulatedSensors;

    struct SlowCollector(Duration);

    impl TelemetryCollector for SlowCollector {
        fn collect(&mut self, _connected_clients: usize) -> TelemetrySnapshot {
            std::thread::sleep(self.0);
            TelemetrySnapshot::error("late")
        }
    }

    struct PanickingCollector;

    impl TelemetryCollector for PanickingCollector {
        fn collect(&mut self, _connected_clients: usize) -> TelemetrySnapshot {
            panic!("sensor bus exploded");
        }
    }

    fn system_collector() -> SystemCollector {
        let sensors = SensorSuite::new(
            Box::new(SimulatedSensors::default()),
            &SensorConfig::default(),
        );
        SystemCollector::new(CollectorConfig::default(), sensors)
    }

    #[test]
    fn test_system_collector_snapshot() {
        let mut collector = system_collector();
        let snapshot = collector.collect(3);

        let stats = snapshot.stats().expect("system collection should succeed");
        assert_eq!(stats.system.connected_clients, 3);
        assert!(stats.cpu.count_logical > 0);
        assert_eq!(stats.cpu.per_core_usage.len(), stats.cpu.count_logical);
        assert!(stats.memory.total_gb > 0.0);
        assert!(stats.processes.top_cpu_usage.len() <= 10);
        assert!(!stats.custom_sensors.gpio_available);
        assert!(stats.custom_sensors.ph_level.is_some());
    }

    #[test]
    fn test_top_processes_limit() {
        let sensors = SensorSuite::new(
            Box::new(SimulatedSensors::default()),
            &SensorConfig::default(),
        );
        let config = CollectorConfig {
            top_processes: 2,
            ..CollectorConfig::default()
        };
        let mut collector = SystemCollector::new(config, sensors);

        let snapshot = collector.collect(0);
        let processes = &snapshot.stats().unwrap().processes;
        assert!(processes.top_cpu_usage.len() <= 2);
        assert!(processes.total_count >= processes.top_cpu_usage.len());
    }

    #[tokio::test]
    async fn test_guarded_collector_times_out() {
        let guarded = GuardedCollector::new(
            SlowCollector(Duration::from_millis(500)),
            Duration::from_millis(50),
        );

        let snapshot = guarded.collect(0).await;
        match snapshot {
            TelemetrySnapshot::Error(err) => assert!(err.error.contains("timed out")),
            other => panic!("expected error snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_guarded_collector_skips_while_busy() {
        let guarded = GuardedCollector::new(
            SlowCollector(Duration::from_millis(300)),
            Duration::from_millis(50),
        );

        let first = guarded.collect(0).await;
        assert!(first.is_error());
        // The first collection is still holding the lock.
        let second = guarded.collect(0).await;
        match second {
            TelemetrySnapshot::Error(err) => assert!(err.error.contains("still running")),
            other => panic!("expected error snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_guarded_collector_survives_panic() {
        let guarded = GuardedCollector::new(PanickingCollector, Duration::from_secs(1));

        assert!(guarded.collect(0).await.is_error());
        // The mutex is not poisoned; the next call runs again.
        assert!(guarded.collect(0).await.is_error());
    }
}
