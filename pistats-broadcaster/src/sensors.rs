//! Water and ambient sensors.
//!
//! Real readings come from an HC-SR04 ultrasonic ranger and a digital
//! turbidity probe wired to the Pi's GPIO header, accessed through the sysfs
//! GPIO interface. When the pins cannot be claimed a [`SimulatedSensors`]
//! bank produces plausible values instead. The choice is made once at startup
//! by [`open_sensor_bank`].

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use pistats_common::Turbidity;
use pistats_common::snapshot::{CustomSensors, round2};

use crate::arduino::ArduinoLatest;
use crate::config::{HardwareMode, SensorConfig};

/// Speed of sound halved, in cm/s: pulse duration × this = distance.
const HALF_SPEED_OF_SOUND_CM_S: f64 = 17_150.0;

/// Settle time with the trigger held low before a measurement.
const TRIGGER_SETTLE: Duration = Duration::from_millis(50);

/// Width of the trigger pulse.
const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// Errors from sensor hardware access.
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("GPIO {pin}: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("GPIO sensors required but unavailable: {0}")]
    Unavailable(String),
}

/// Source of distance and turbidity readings.
pub trait SensorBank: Send {
    /// Whether readings come from real hardware.
    fn is_hardware(&self) -> bool;

    /// Distance to the water surface in cm, `None` if the echo timed out.
    fn distance_cm(&mut self) -> Option<f64>;

    fn turbidity(&mut self) -> Option<Turbidity>;
}

/// Random readings within the ranges a healthy tank shows.
pub struct Simulator {
    rng: SmallRng,
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            rng: SmallRng::from_os_rng(),
        }
    }

    /// 25 ± 3 °C.
    pub fn ambient_celsius(&mut self) -> f64 {
        round2(25.0 + self.rng.random_range(-3.0..=3.0))
    }

    /// 25 ± 2 cm.
    pub fn distance_cm(&mut self) -> f64 {
        round2(25.0 + self.rng.random_range(-2.0..=2.0))
    }

    /// pH 7 ± 0.3.
    pub fn ph_level(&mut self) -> f64 {
        round2(7.0 + self.rng.random_range(-0.3..=0.3))
    }

    /// Clear four times out of five.
    pub fn turbidity(&mut self) -> Turbidity {
        if self.rng.random_bool(0.8) {
            Turbidity::Clear
        } else {
            Turbidity::Turbid
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sensor bank used when no GPIO hardware is present.
#[derive(Default)]
pub struct SimulatedSensors {
    sim: Simulator,
}

impl SensorBank for SimulatedSensors {
    fn is_hardware(&self) -> bool {
        false
    }

    fn distance_cm(&mut self) -> Option<f64> {
        Some(self.sim.distance_cm())
    }

    fn turbidity(&mut self) -> Option<Turbidity> {
        Some(self.sim.turbidity())
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// One exported sysfs GPIO line.
#[derive(Debug)]
struct GpioPin {
    number: u32,
    dir: PathBuf,
}

impl GpioPin {
    fn export(root: &Path, number: u32, direction: Direction) -> Result<Self, SensorError> {
        let io_err = |source| SensorError::Gpio {
            pin: number,
            source,
        };

        let dir = root.join(format!("gpio{}", number));
        if !dir.exists() {
            fs::write(root.join("export"), number.to_string()).map_err(io_err)?;
        }
        fs::write(dir.join("direction"), direction.as_str()).map_err(io_err)?;

        Ok(Self { number, dir })
    }

    fn read(&self) -> Result<bool, SensorError> {
        let value = fs::read_to_string(self.dir.join("value")).map_err(|source| {
            SensorError::Gpio {
                pin: self.number,
                source,
            }
        })?;
        Ok(value.trim() == "1")
    }

    fn write(&self, high: bool) -> Result<(), SensorError> {
        fs::write(self.dir.join("value"), if high { "1" } else { "0" }).map_err(|source| {
            SensorError::Gpio {
                pin: self.number,
                source,
            }
        })
    }

    fn unexport(&self, root: &Path) {
        if let Err(e) = fs::write(root.join("unexport"), self.number.to_string()) {
            debug!("Failed to unexport GPIO {}: {}", self.number, e);
        }
    }
}

/// Poll `condition` until it holds or `deadline` passes.
///
/// Returns the instant the condition was first observed true, or `None` on
/// timeout.
pub fn wait_for<F>(mut condition: F, deadline: Instant) -> Result<Option<Instant>, SensorError>
where
    F: FnMut() -> Result<bool, SensorError>,
{
    loop {
        if condition()? {
            return Ok(Some(Instant::now()));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::yield_now();
    }
}

/// Ultrasonic ranger and turbidity probe on sysfs GPIO.
#[derive(Debug)]
pub struct GpioSensors {
    root: PathBuf,
    trig: GpioPin,
    echo: GpioPin,
    turbidity: GpioPin,
    echo_timeout: Duration,
}

impl GpioSensors {
    /// Claim the configured pins. Fails if any pin cannot be exported.
    pub fn open(config: &SensorConfig) -> Result<Self, SensorError> {
        let root = config.gpio_root.clone();
        let base = config.gpio_base;

        let trig = GpioPin::export(&root, base + config.trig_pin, Direction::Out)?;
        let echo = GpioPin::export(&root, base + config.echo_pin, Direction::In)?;
        let turbidity = GpioPin::export(&root, base + config.turbidity_pin, Direction::In)?;

        Ok(Self {
            root,
            trig,
            echo,
            turbidity,
            echo_timeout: config.echo_timeout(),
        })
    }

    fn measure_distance(&self) -> Result<Option<f64>, SensorError> {
        self.trig.write(false)?;
        thread::sleep(TRIGGER_SETTLE);

        self.trig.write(true)?;
        thread::sleep(TRIGGER_PULSE);
        self.trig.write(false)?;

        let deadline = Instant::now() + self.echo_timeout;

        let Some(pulse_start) = wait_for(|| self.echo.read(), deadline)? else {
            return Ok(None);
        };
        let Some(pulse_end) = wait_for(|| self.echo.read().map(|high| !high), deadline)? else {
            return Ok(None);
        };

        let duration = pulse_end.duration_since(pulse_start).as_secs_f64();
        Ok(Some(round2(duration * HALF_SPEED_OF_SOUND_CM_S)))
    }
}

impl SensorBank for GpioSensors {
    fn is_hardware(&self) -> bool {
        true
    }

    fn distance_cm(&mut self) -> Option<f64> {
        match self.measure_distance() {
            Ok(Some(distance)) => Some(distance),
            Ok(None) => {
                debug!("Ultrasonic echo timed out");
                None
            }
            Err(e) => {
                warn!("Failed to read ultrasonic sensor: {}", e);
                None
            }
        }
    }

    fn turbidity(&mut self) -> Option<Turbidity> {
        match self.turbidity.read() {
            Ok(true) => Some(Turbidity::Clear),
            Ok(false) => Some(Turbidity::Turbid),
            Err(e) => {
                warn!("Failed to read turbidity sensor: {}", e);
                None
            }
        }
    }
}

impl Drop for GpioSensors {
    fn drop(&mut self) {
        for pin in [&self.trig, &self.echo, &self.turbidity] {
            pin.unexport(&self.root);
        }
    }
}

/// Select the sensor bank once, according to the configured hardware mode.
pub fn open_sensor_bank(config: &SensorConfig) -> Result<Box<dyn SensorBank>, SensorError> {
    match config.hardware {
        HardwareMode::Disabled => {
            info!("GPIO sensors disabled, using simulated readings");
            Ok(Box::new(SimulatedSensors::default()))
        }
        HardwareMode::Enabled => match GpioSensors::open(config) {
            Ok(bank) => Ok(Box::new(bank)),
            Err(e) => Err(SensorError::Unavailable(e.to_string())),
        },
        HardwareMode::Auto => match GpioSensors::open(config) {
            Ok(bank) => {
                info!("GPIO sensors initialized");
                Ok(Box::new(bank))
            }
            Err(e) => {
                warn!("GPIO not available, using simulated sensor data: {}", e);
                Ok(Box::new(SimulatedSensors::default()))
            }
        },
    }
}

/// Produces the `custom_sensors` group of each snapshot.
pub struct SensorSuite {
    bank: Box<dyn SensorBank>,
    sim: Simulator,
    thermal_zone: PathBuf,
    ambient_offset: f64,
    arduino: Option<(ArduinoLatest, Duration)>,
}

impl SensorSuite {
    pub fn new(bank: Box<dyn SensorBank>, config: &SensorConfig) -> Self {
        Self {
            bank,
            sim: Simulator::new(),
            thermal_zone: config.thermal_zone.clone(),
            ambient_offset: config.ambient_offset_celsius,
            arduino: None,
        }
    }

    /// Take pH and analog turbidity from the Arduino while its readings are
    /// younger than `max_age`.
    pub fn with_arduino(mut self, latest: ArduinoLatest, max_age: Duration) -> Self {
        self.arduino = Some((latest, max_age));
        self
    }

    pub fn read(&mut self) -> CustomSensors {
        let arduino = self
            .arduino
            .as_ref()
            .and_then(|(latest, max_age)| latest.fresh(*max_age));

        let ambient = match read_thermal_zone(&self.thermal_zone) {
            Some(celsius) => round2(celsius - self.ambient_offset),
            None => self.sim.ambient_celsius(),
        };

        CustomSensors {
            ambient_temp_celsius: Some(ambient),
            ultrasonic_distance_cm: self.bank.distance_cm(),
            water_turbidity: self.bank.turbidity(),
            ph_level: Some(match arduino {
                Some(reading) => round2(reading.ph),
                None => self.sim.ph_level(),
            }),
            gpio_available: self.bank.is_hardware(),
            turbidity_raw: arduino.map(|reading| round2(reading.turbidity)),
        }
    }
}

/// Read a thermal zone file (millidegrees) as °C.
pub fn read_thermal_zone(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    let milli: i64 = raw.trim().parse().ok()?;
    Some(milli as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arduino::ArduinoReading;

    fn gpio_fixture(pins: &[(u32, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pin, value) in pins {
            let pin_dir = dir.path().join(format!("gpio{}", pin));
            fs::create_dir_all(&pin_dir).unwrap();
            fs::write(pin_dir.join("value"), value).unwrap();
        }
        dir
    }

    fn fixture_config(root: &Path) -> SensorConfig {
        SensorConfig {
            gpio_root: root.to_path_buf(),
            echo_timeout_ms: 20,
            thermal_zone: root.join("thermal"),
            ..SensorConfig::default()
        }
    }

    #[test]
    fn test_simulated_ranges() {
        let mut sim = Simulator::new();
        for _ in 0..200 {
            let ambient = sim.ambient_celsius();
            assert!((22.0..=28.0).contains(&ambient), "ambient {}", ambient);
            let distance = sim.distance_cm();
            assert!((23.0..=27.0).contains(&distance), "distance {}", distance);
            let ph = sim.ph_level();
            assert!((6.7..=7.3).contains(&ph), "ph {}", ph);
        }
    }

    #[test]
    fn test_simulated_turbidity_mostly_clear() {
        let mut sim = Simulator::new();
        let clear = (0..1000)
            .filter(|_| sim.turbidity() == Turbidity::Clear)
            .count();
        assert!(clear > 650, "only {} clear readings", clear);
    }

    #[test]
    fn test_wait_for_condition_met() {
        let mut polls = 0;
        let seen = wait_for(
            || {
                polls += 1;
                Ok(polls >= 3)
            },
            Instant::now() + Duration::from_secs(1),
        )
        .unwrap();
        assert!(seen.is_some());
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_wait_for_times_out() {
        let started = Instant::now();
        let seen = wait_for(|| Ok(false), started + Duration::from_millis(20)).unwrap();
        assert!(seen.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_for_propagates_read_error() {
        let result = wait_for(
            || {
                Err(SensorError::Gpio {
                    pin: 24,
                    source: std::io::Error::other("gone"),
                })
            },
            Instant::now() + Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_gpio_sensors_from_sysfs() {
        let root = gpio_fixture(&[(23, "0"), (24, "0"), (17, "1")]);
        let config = fixture_config(root.path());

        let mut bank = GpioSensors::open(&config).unwrap();
        assert!(bank.is_hardware());
        assert_eq!(bank.turbidity(), Some(Turbidity::Clear));
        // Echo never rises in the fixture.
        assert_eq!(bank.distance_cm(), None);

        let direction = fs::read_to_string(root.path().join("gpio23/direction")).unwrap();
        assert_eq!(direction, "out");
    }

    #[test]
    fn test_gpio_base_offsets_pins() {
        let root = gpio_fixture(&[(535, "0"), (536, "0"), (529, "0")]);
        let config = SensorConfig {
            gpio_base: 512,
            ..fixture_config(root.path())
        };

        let mut bank = GpioSensors::open(&config).unwrap();
        assert_eq!(bank.turbidity(), Some(Turbidity::Turbid));
    }

    #[test]
    fn test_auto_mode_falls_back_to_simulation() {
        let root = tempfile::tempdir().unwrap();
        let config = SensorConfig {
            gpio_root: root.path().join("missing"),
            ..SensorConfig::default()
        };

        let bank = open_sensor_bank(&config).unwrap();
        assert!(!bank.is_hardware());
    }

    #[test]
    fn test_enabled_mode_requires_hardware() {
        let root = tempfile::tempdir().unwrap();
        let config = SensorConfig {
            hardware: HardwareMode::Enabled,
            gpio_root: root.path().join("missing"),
            ..SensorConfig::default()
        };

        assert!(matches!(
            open_sensor_bank(&config),
            Err(SensorError::Unavailable(_))
        ));
    }

    #[test]
    fn test_ambient_applies_offset() {
        let root = tempfile::tempdir().unwrap();
        let config = fixture_config(root.path());
        fs::write(&config.thermal_zone, "48300\n").unwrap();

        let mut suite = SensorSuite::new(Box::new(SimulatedSensors::default()), &config);
        let sensors = suite.read();

        assert_eq!(sensors.ambient_temp_celsius, Some(32.8));
        assert!(!sensors.gpio_available);
        assert!(sensors.ultrasonic_distance_cm.is_some());
        assert!(sensors.water_turbidity.is_some());
        assert!(sensors.turbidity_raw.is_none());
    }

    #[test]
    fn test_missing_thermal_zone_is_simulated() {
        let root = tempfile::tempdir().unwrap();
        let config = fixture_config(root.path());

        let mut suite = SensorSuite::new(Box::new(SimulatedSensors::default()), &config);
        let ambient = suite.read().ambient_temp_celsius.unwrap();
        assert!((22.0..=28.0).contains(&ambient));
    }

    #[test]
    fn test_fresh_arduino_reading_is_used() {
        let root = tempfile::tempdir().unwrap();
        let config = fixture_config(root.path());
        let latest = ArduinoLatest::default();
        latest.update(ArduinoReading {
            ph: 6.512,
            turbidity: 812.0,
        });

        let mut suite = SensorSuite::new(Box::new(SimulatedSensors::default()), &config)
            .with_arduino(latest, Duration::from_secs(10));
        let sensors = suite.read();

        assert_eq!(sensors.ph_level, Some(6.51));
        assert_eq!(sensors.turbidity_raw, Some(812.0));
    }
}
