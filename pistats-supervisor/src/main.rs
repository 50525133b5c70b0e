//! Connectivity supervisor.
//!
//! Runs until SIGINT or SIGTERM, then stops the broadcaster before exiting.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use pistats_framework::{ServiceArgs, ServiceConfig, ServiceRunner};

use pistats_supervisor::config::SupervisorConfig;
use pistats_supervisor::detector::{Connectivity, NetworkDetector, is_valid_address};
use pistats_supervisor::monitor::Supervisor;
use pistats_supervisor::process::{ProcessControl, ProcessController, resolve_command};

#[derive(Parser, Debug)]
#[command(about = "Keeps the pistats broadcaster running while the network is up")]
struct Args {
    #[command(flatten)]
    service: ServiceArgs,

    /// Print a one-off connectivity report and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config =
        SupervisorConfig::load_or_default(args.service.config.as_deref(), "supervisor.json5")?;

    if args.check {
        return check(&config).await;
    }

    let runner = ServiceRunner::new("pistats-supervisor", config, Some(&args.service))?;
    let config = runner.config().clone();

    let Some(executable) = resolve_command(&config.broadcaster.command) else {
        tracing::error!("Broadcaster executable not found: {}", config.broadcaster.command);
        bail!("broadcaster executable `{}` not found", config.broadcaster.command);
    };
    tracing::info!("Broadcaster executable: {}", executable.display());
    tracing::info!("Monitoring interface {}", config.interface);

    let stop_limit = config.broadcaster.stop_timeout() + Duration::from_secs(2);
    let mut runner = runner.with_shutdown_grace(stop_limit + Duration::from_secs(1));

    let supervisor = Supervisor::new(
        NetworkDetector::new(&config),
        ProcessController::new(config.broadcaster.clone()),
        config.check_interval(),
        stop_limit,
    );
    runner.spawn("supervisor", supervisor.run(runner.cancel_token()));

    runner.run().await?;
    Ok(())
}

/// Diagnostic report for setting up a new node.
async fn check(config: &SupervisorConfig) -> Result<()> {
    let detector = NetworkDetector::new(config);
    let controller = ProcessController::new(config.broadcaster.clone());

    println!("Interface:        {}", detector.interface());
    let address = detector.detect().await;
    match address {
        Some(ip) => println!("Address:          {}", ip),
        None => println!("Address:          none"),
    }
    if address.is_some() {
        let online = detector.has_internet().await;
        println!(
            "Internet:         {}",
            if online { "reachable" } else { "unreachable" }
        );
    }
    println!(
        "Broadcaster:      {}",
        if controller.is_running().await { "running" } else { "not running" }
    );
    match resolve_command(&config.broadcaster.command) {
        Some(path) => println!("Executable:       {}", path.display()),
        None => println!("Executable:       {} (not found)", config.broadcaster.command),
    }

    println!();
    println!("Address validity:");
    for ip in [
        Ipv4Addr::new(127, 0, 0, 1),
        Ipv4Addr::new(169, 254, 1, 1),
        Ipv4Addr::new(192, 168, 1, 100),
        Ipv4Addr::new(10, 0, 0, 1),
    ] {
        println!(
            "  {:<16} {}",
            ip,
            if is_valid_address(ip) { "valid" } else { "rejected" }
        );
    }

    Ok(())
}
