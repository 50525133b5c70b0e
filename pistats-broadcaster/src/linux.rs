//! Linux-specific readings from procfs and sysfs.
//!
//! These fill the snapshot fields sysinfo does not expose:
//! - Block device I/O counters (`/proc/diskstats`)
//! - Page cache and buffer sizes (`/proc/meminfo`)
//! - Interface drop counters (`/proc/net/dev`)
//! - Temperature sensors (hwmon)
//! - CPU frequency limits (cpufreq)
//! - Battery state (power_supply)
//! - Raspberry Pi SoC temperature (`vcgencmd`)

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use procfs::Current;
use tracing::{debug, warn};

use pistats_common::snapshot::{Battery, DiskIoCounters, TemperatureSensor, round2};

pub const HWMON_ROOT: &str = "/sys/class/hwmon";
pub const CPUFREQ_ROOT: &str = "/sys/devices/system/cpu/cpu0/cpufreq";
pub const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

const SECTOR_SIZE: u64 = 512;

/// Cumulative I/O counters summed over whole disks.
///
/// Partitions are skipped so their traffic is not counted twice, as are
/// loop, ram and device-mapper devices.
pub fn disk_io_counters() -> DiskIoCounters {
    let Ok(diskstats) = procfs::diskstats() else {
        warn!("Failed to read /proc/diskstats");
        return DiskIoCounters::default();
    };

    let mut totals = DiskTotals::default();
    for disk in diskstats {
        let name = &disk.name;
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("dm-") {
            continue;
        }
        if !is_whole_disk(name) {
            continue;
        }

        totals.read_count += disk.reads;
        totals.write_count += disk.writes;
        totals.read_bytes += disk.sectors_read * SECTOR_SIZE;
        totals.write_bytes += disk.sectors_written * SECTOR_SIZE;
        totals.read_time += disk.time_reading;
        totals.write_time += disk.time_writing;
    }

    totals.into()
}

#[derive(Debug, Default)]
struct DiskTotals {
    read_count: u64,
    write_count: u64,
    read_bytes: u64,
    write_bytes: u64,
    read_time: u64,
    write_time: u64,
}

impl From<DiskTotals> for DiskIoCounters {
    fn from(t: DiskTotals) -> Self {
        DiskIoCounters {
            read_count: Some(t.read_count),
            write_count: Some(t.write_count),
            read_bytes: Some(t.read_bytes),
            write_bytes: Some(t.write_bytes),
            read_time: Some(t.read_time),
            write_time: Some(t.write_time),
        }
    }
}

fn is_whole_disk(name: &str) -> bool {
    let sys_block = Path::new("/sys/block");
    !sys_block.exists() || sys_block.join(name).exists()
}

/// Page cache and buffer sizes in bytes.
pub fn cached_and_buffers() -> Option<(u64, u64)> {
    match procfs::Meminfo::current() {
        Ok(meminfo) => Some((meminfo.cached, meminfo.buffers)),
        Err(e) => {
            warn!("Failed to read /proc/meminfo: {}", e);
            None
        }
    }
}

/// Inbound and outbound drop counters summed over all interfaces.
pub fn network_drops() -> Option<(u64, u64)> {
    match procfs::net::dev_status() {
        Ok(devices) => Some(devices.values().fold((0, 0), |(rx, tx), dev| {
            (rx + dev.recv_drop, tx + dev.sent_drop)
        })),
        Err(e) => {
            warn!("Failed to read /proc/net/dev: {}", e);
            None
        }
    }
}

/// Temperature readings under `root` (normally [`HWMON_ROOT`]), keyed by chip.
pub fn collect_temperatures(root: &Path) -> BTreeMap<String, Vec<TemperatureSensor>> {
    let mut chips: BTreeMap<String, Vec<TemperatureSensor>> = BTreeMap::new();

    let Ok(entries) = fs::read_dir(root) else {
        return chips;
    };

    for entry in entries.flatten() {
        let hwmon_path = entry.path();

        let chip_name = fs::read_to_string(hwmon_path.join("name"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let Ok(files) = fs::read_dir(&hwmon_path) else {
            continue;
        };

        let mut inputs: Vec<String> = files
            .flatten()
            .map(|f| f.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("temp") && name.ends_with("_input"))
            .collect();
        inputs.sort();

        for file_name in inputs {
            // "temp1_input" -> "1"
            let sensor_num = file_name
                .strip_prefix("temp")
                .and_then(|s| s.strip_suffix("_input"))
                .unwrap_or("0");

            let Some(current) = read_millidegrees(&hwmon_path.join(&file_name)) else {
                continue;
            };

            let label = fs::read_to_string(hwmon_path.join(format!("temp{}_label", sensor_num)))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| format!("temp{}", sensor_num));

            chips
                .entry(chip_name.clone())
                .or_default()
                .push(TemperatureSensor {
                    label,
                    current,
                    high: read_millidegrees(&hwmon_path.join(format!("temp{}_max", sensor_num))),
                    critical: read_millidegrees(
                        &hwmon_path.join(format!("temp{}_crit", sensor_num)),
                    ),
                });
        }
    }

    chips
}

fn read_millidegrees(path: &Path) -> Option<f64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|v| round2(v as f64 / 1000.0))
}

/// Minimum and maximum CPU frequency in MHz from a cpufreq directory.
pub fn cpu_frequency_limits(root: &Path) -> (Option<f64>, Option<f64>) {
    let read_khz = |names: [&str; 2]| {
        names.iter().find_map(|name| {
            fs::read_to_string(root.join(name))
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|khz| khz as f64 / 1000.0)
        })
    };

    (
        read_khz(["scaling_min_freq", "cpuinfo_min_freq"]),
        read_khz(["scaling_max_freq", "cpuinfo_max_freq"]),
    )
}

/// Battery state from a power_supply directory, `None` without a battery.
pub fn battery(root: &Path) -> Option<Battery> {
    let entries = fs::read_dir(root).ok()?;

    let mut battery_dir = None;
    let mut mains_online = None;

    for entry in entries.flatten() {
        let path = entry.path();
        let kind = read_trimmed(&path.join("type")).unwrap_or_default();
        match kind.as_str() {
            "Battery" if battery_dir.is_none() => battery_dir = Some(path),
            "Mains" | "USB" => {
                if let Some(online) = read_trimmed(&path.join("online")) {
                    let online = online == "1";
                    mains_online = Some(mains_online.unwrap_or(false) || online);
                }
            }
            _ => {}
        }
    }

    let dir = battery_dir?;
    let percent = read_trimmed(&dir.join("capacity"))?.parse::<f64>().ok()?;
    let status = read_trimmed(&dir.join("status")).unwrap_or_default();

    let power_plugged = mains_online.or(match status.as_str() {
        "Charging" | "Full" => Some(true),
        "Discharging" => Some(false),
        _ => None,
    });

    let secsleft = if power_plugged == Some(false) {
        seconds_left(&dir)
    } else {
        None
    };

    Some(Battery {
        percent,
        power_plugged,
        secsleft,
    })
}

fn seconds_left(dir: &Path) -> Option<u64> {
    let read = |name: &str| read_trimmed(&dir.join(name)).and_then(|s| s.parse::<u64>().ok());

    let (remaining, rate) = match (read("energy_now"), read("power_now")) {
        (Some(energy), Some(power)) => (energy, power),
        _ => (read("charge_now")?, read("current_now")?),
    };
    if rate == 0 {
        return None;
    }
    Some(remaining * 3600 / rate)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// SoC temperature reported by the VideoCore firmware.
pub fn vcgencmd_temperature() -> Option<f64> {
    let output = match Command::new("vcgencmd").arg("measure_temp").output() {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!("vcgencmd exited with {}", output.status);
            return None;
        }
        Err(e) => {
            debug!("vcgencmd unavailable: {}", e);
            return None;
        }
    };

    parse_vcgencmd_temp(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `temp=42.8'C`.
pub fn parse_vcgencmd_temp(output: &str) -> Option<f64> {
    output
        .trim()
        .strip_prefix("temp=")?
        .strip_suffix("'C")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_vcgencmd_temp() {
        assert_eq!(parse_vcgencmd_temp("temp=42.8'C\n"), Some(42.8));
        assert_eq!(parse_vcgencmd_temp("temp=55.0'C"), Some(55.0));
        assert_eq!(parse_vcgencmd_temp("error=1 error_msg=\"x\""), None);
        assert_eq!(parse_vcgencmd_temp(""), None);
    }

    #[test]
    fn test_collect_temperatures_groups_by_chip() {
        let root = tempfile::tempdir().unwrap();
        let hwmon0 = root.path().join("hwmon0");
        write(&hwmon0.join("name"), "cpu_thermal\n");
        write(&hwmon0.join("temp1_input"), "48312\n");
        write(&hwmon0.join("temp1_crit"), "110000\n");

        let hwmon1 = root.path().join("hwmon1");
        write(&hwmon1.join("name"), "nvme\n");
        write(&hwmon1.join("temp1_input"), "35850\n");
        write(&hwmon1.join("temp1_label"), "Composite\n");
        write(&hwmon1.join("temp1_max"), "81850\n");

        let chips = collect_temperatures(root.path());

        assert_eq!(chips.len(), 2);
        let cpu = &chips["cpu_thermal"][0];
        assert_eq!(cpu.label, "temp1");
        assert_eq!(cpu.current, 48.31);
        assert_eq!(cpu.critical, Some(110.0));
        assert_eq!(cpu.high, None);

        let nvme = &chips["nvme"][0];
        assert_eq!(nvme.label, "Composite");
        assert_eq!(nvme.high, Some(81.85));
    }

    #[test]
    fn test_collect_temperatures_missing_root() {
        assert!(collect_temperatures(Path::new("/nonexistent/hwmon")).is_empty());
    }

    #[test]
    fn test_cpu_frequency_limits() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("cpuinfo_min_freq"), "600000\n");
        write(&root.path().join("scaling_max_freq"), "1500000\n");
        write(&root.path().join("cpuinfo_max_freq"), "1800000\n");

        assert_eq!(
            cpu_frequency_limits(root.path()),
            (Some(600.0), Some(1500.0))
        );
    }

    #[test]
    fn test_no_battery() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("AC/type"), "Mains\n");
        write(&root.path().join("AC/online"), "1\n");

        assert_eq!(battery(root.path()), None);
    }

    #[test]
    fn test_discharging_battery() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("AC/type"), "Mains\n");
        write(&root.path().join("AC/online"), "0\n");
        write(&root.path().join("BAT0/type"), "Battery\n");
        write(&root.path().join("BAT0/capacity"), "87\n");
        write(&root.path().join("BAT0/status"), "Discharging\n");
        write(&root.path().join("BAT0/energy_now"), "30000000\n");
        write(&root.path().join("BAT0/power_now"), "10000000\n");

        let battery = battery(root.path()).unwrap();
        assert_eq!(battery.percent, 87.0);
        assert_eq!(battery.power_plugged, Some(false));
        assert_eq!(battery.secsleft, Some(10_800));
    }

    #[test]
    fn test_charging_battery_has_no_time_left() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("BAT0/type"), "Battery\n");
        write(&root.path().join("BAT0/capacity"), "40\n");
        write(&root.path().join("BAT0/status"), "Charging\n");

        let battery = battery(root.path()).unwrap();
        assert_eq!(battery.power_plugged, Some(true));
        assert_eq!(battery.secsleft, None);
    }

    #[test]
    fn test_procfs_readers_do_not_panic() {
        let counters = disk_io_counters();
        let _ = counters.read_bytes;
        let _ = cached_and_buffers();
        let _ = network_drops();
    }
}
