//! Telemetry broadcaster for a Raspberry Pi water-monitoring node.
//!
//! Collects system metrics (CPU, memory, disk, network, processes,
//! temperatures, battery) and water sensor readings once per second and
//! pushes each snapshot as one JSON text frame to every subscriber connected
//! to the WebSocket port (8765 by default).
//!
//! # Components
//!
//! - [`registry`] - Live subscriber set
//! - [`collector`] - Snapshot collection and the timeout guard around it
//! - [`sensors`] - GPIO and simulated water sensors
//! - [`arduino`] - Optional serial pH/turbidity source
//! - [`broadcast`] - Periodic broadcast loop
//! - [`server`] - WebSocket accept loop and per-connection handling

pub mod arduino;
pub mod broadcast;
pub mod collector;
pub mod config;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod registry;
pub mod sensors;
pub mod server;
