//! Connectivity supervisor for the pistats broadcaster.
//!
//! Checks the wireless interface every few seconds and keeps the telemetry
//! broadcaster running exactly while the host has an address and can reach
//! the internet. The broadcaster is an independent process; the supervisor
//! only starts, stops and looks for it.
//!
//! # Components
//!
//! - [`detector`] - Address detection cascade and internet probe
//! - [`process`] - Broadcaster start/stop through the OS process table
//! - [`state`] - Connected/disconnected transitions
//! - [`monitor`] - Poll loop tying them together

pub mod config;
pub mod detector;
pub mod monitor;
pub mod process;
pub mod state;
