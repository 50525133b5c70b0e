//! Telemetry broadcaster.
//!
//! Serves system and sensor snapshots over WebSocket until SIGINT or SIGTERM.

use std::time::Duration;

use anyhow::Result;
use pistats_framework::{ServiceArgs, ServiceConfig, ServiceRunner};

use pistats_broadcaster::arduino::{self, ArduinoLatest};
use pistats_broadcaster::collector::{GuardedCollector, SystemCollector};
use pistats_broadcaster::config::BroadcasterConfig;
use pistats_broadcaster::sensors::{SensorSuite, open_sensor_bank};
use pistats_broadcaster::server::TelemetryServer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServiceArgs::parse();
    let config = BroadcasterConfig::load_or_default(args.config.as_deref(), "broadcaster.json5")?;

    let runner = ServiceRunner::new("pistats-broadcaster", config, Some(&args))?;
    let config = runner.config().clone();
    let mut runner = runner.with_shutdown_grace(config.shutdown_grace());

    let bank = open_sensor_bank(&config.sensors)?;
    let mut sensors = SensorSuite::new(bank, &config.sensors);

    if let Some(serial) = config.sensors.arduino.clone() {
        let latest = ArduinoLatest::default();
        sensors = sensors.with_arduino(latest.clone(), Duration::from_secs(serial.max_age_secs));
        runner.spawn("arduino", arduino::run(serial, latest, runner.cancel_token()));
    }

    let collector = GuardedCollector::new(
        SystemCollector::new(config.collector.clone(), sensors),
        config.collector.timeout(),
    );

    // Bind before spawning so a busy port fails the process immediately.
    let server = TelemetryServer::bind(config.server.clone(), collector).await?;
    runner.spawn_with_error("server", server.run(runner.cancel_token()));

    runner.run().await?;
    Ok(())
}
