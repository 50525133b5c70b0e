//! Connectivity detection.
//!
//! The host address on the watched interface is found by a cascade of
//! independent strategies, each tried only when the previous one produced
//! nothing usable:
//!
//! 1. [`RouteProbe`]: connect a UDP socket towards an external address and
//!    read back the local address the kernel picked, then check that it
//!    belongs to the interface.
//! 2. [`IpCommand`]: parse `ip -4 addr show <iface>` for a global address.
//! 3. [`InterfaceTable`]: look the interface up in the OS address table.
//!
//! Internet reachability is a separate, bounded TCP connect.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use if_addrs::IfAddr;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{ProbeConfig, SupervisorConfig};

/// Errors from a single detection strategy.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },
}

/// Answers "which address do we have" and "can we reach the internet".
pub trait Connectivity: Send + Sync {
    /// Usable IPv4 address on the watched interface, if any.
    fn detect(&self) -> impl Future<Output = Option<Ipv4Addr>> + Send;

    /// Whether an outbound connection to the internet succeeds.
    fn has_internet(&self) -> impl Future<Output = bool> + Send;
}

/// One way of finding the interface address.
pub trait AddressStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidate address on `interface`. May block briefly.
    fn lookup(&self, interface: &str) -> Result<Option<Ipv4Addr>, DetectError>;
}

/// Whether `ip` can be a routable host address: not loopback
/// (127.0.0.0/8), not link-local (169.254.0.0/16), not unspecified.
pub fn is_valid_address(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
}

/// Run `strategies` in order and return the first valid address.
pub fn cascade(strategies: &[Box<dyn AddressStrategy>], interface: &str) -> Option<Ipv4Addr> {
    for strategy in strategies {
        match strategy.lookup(interface) {
            Ok(Some(ip)) if is_valid_address(ip) => {
                debug!("{} found {} on {}", strategy.name(), ip, interface);
                return Some(ip);
            }
            Ok(Some(ip)) => {
                debug!("{} returned unusable address {}", strategy.name(), ip);
            }
            Ok(None) => {
                debug!("{} found no address on {}", strategy.name(), interface);
            }
            Err(e) => {
                debug!("{} failed: {}", strategy.name(), e);
            }
        }
    }
    None
}

/// IPv4 addresses currently assigned to `interface`.
fn interface_ipv4_addrs(interface: &str) -> Result<Vec<Ipv4Addr>, DetectError> {
    Ok(if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| iface.name == interface)
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(v4.ip),
            IfAddr::V6(_) => None,
        })
        .collect())
}

/// Local address of a UDP socket connected towards `target`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub struct RouteProbe {
    target: String,
}

impl RouteProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl AddressStrategy for RouteProbe {
    fn name(&self) -> &'static str {
        "route probe"
    }

    fn lookup(&self, interface: &str) -> Result<Option<Ipv4Addr>, DetectError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(&self.target)?;

        let IpAddr::V4(local) = socket.local_addr()?.ip() else {
            return Ok(None);
        };

        // The default route may leave through another interface.
        if interface_ipv4_addrs(interface)?.contains(&local) {
            Ok(Some(local))
        } else {
            debug!("Route probe address {} is not on {}", local, interface);
            Ok(None)
        }
    }
}

/// Global-scope address reported by iproute2.
pub struct IpCommand;

impl AddressStrategy for IpCommand {
    fn name(&self) -> &'static str {
        "ip addr"
    }

    fn lookup(&self, interface: &str) -> Result<Option<Ipv4Addr>, DetectError> {
        let output = Command::new("ip")
            .args(["-4", "addr", "show", interface])
            .output()?;

        if !output.status.success() {
            return Err(DetectError::Command {
                command: format!("ip -4 addr show {}", interface),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_ip_addr_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// First valid global IPv4 address in `ip addr show` output.
pub fn parse_ip_addr_output(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("inet ") && line.contains("scope global"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|cidr| cidr.split('/').next())
        .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
        .find(|ip| is_valid_address(*ip))
}

/// First valid address in the OS interface table.
pub struct InterfaceTable;

impl AddressStrategy for InterfaceTable {
    fn name(&self) -> &'static str {
        "interface table"
    }

    fn lookup(&self, interface: &str) -> Result<Option<Ipv4Addr>, DetectError> {
        Ok(interface_ipv4_addrs(interface)?
            .into_iter()
            .find(|ip| is_valid_address(*ip)))
    }
}

/// Detector for the configured interface using the standard cascade.
pub struct NetworkDetector {
    interface: String,
    strategies: Arc<[Box<dyn AddressStrategy>]>,
    probe: ProbeConfig,
}

impl NetworkDetector {
    pub fn new(config: &SupervisorConfig) -> Self {
        let strategies: Vec<Box<dyn AddressStrategy>> = vec![
            Box::new(RouteProbe::new(config.probe.route_target.clone())),
            Box::new(IpCommand),
            Box::new(InterfaceTable),
        ];
        Self::with_strategies(&config.interface, strategies, config.probe.clone())
    }

    pub fn with_strategies(
        interface: &str,
        strategies: Vec<Box<dyn AddressStrategy>>,
        probe: ProbeConfig,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            strategies: strategies.into(),
            probe,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl Connectivity for NetworkDetector {
    async fn detect(&self) -> Option<Ipv4Addr> {
        let strategies = self.strategies.clone();
        let interface = self.interface.clone();

        match tokio::task::spawn_blocking(move || cascade(&strategies, &interface)).await {
            Ok(address) => address,
            Err(e) => {
                warn!("Address detection task failed: {}", e);
                None
            }
        }
    }

    async fn has_internet(&self) -> bool {
        probe_tcp(&self.probe.internet_target, self.probe.internet_timeout()).await
    }
}

/// Whether a TCP connection to `target` completes within `limit`.
pub async fn probe_tcp(target: &str, limit: Duration) -> bool {
    match tokio::time::timeout(limit, TcpStream::connect(target)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Internet probe to {} failed: {}", target, e);
            false
        }
        Err(_) => {
            debug!("Internet probe to {} timed out", target);
            false
        }
    }
}
