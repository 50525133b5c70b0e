//! Supervisor poll loop.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::detector::Connectivity;
use crate::process::{ProcessControl, StartOutcome};
use crate::state::{Action, ConnectivityState, LinkState, StateMachine};

/// Polls connectivity and keeps the broadcaster running while connected.
pub struct Supervisor<D, P> {
    detector: D,
    controller: P,
    machine: StateMachine,
    interval: Duration,
    stop_limit: Duration,
}

impl<D: Connectivity, P: ProcessControl> Supervisor<D, P> {
    /// `stop_limit` bounds the final stop on shutdown.
    pub fn new(detector: D, controller: P, interval: Duration, stop_limit: Duration) -> Self {
        Self {
            detector,
            controller,
            machine: StateMachine::new(),
            interval,
            stop_limit,
        }
    }

    pub fn state(&self) -> LinkState {
        self.machine.state()
    }

    pub fn controller(&self) -> &P {
        &self.controller
    }

    /// Probe connectivity once. Internet is only checked when an address
    /// was found.
    pub async fn observe(&self) -> ConnectivityState {
        match self.detector.detect().await {
            None => ConnectivityState::NoInterface,
            Some(address) => {
                if self.detector.has_internet().await {
                    ConnectivityState::Connected(address)
                } else {
                    ConnectivityState::InterfaceUpNoInternet(address)
                }
            }
        }
    }

    /// Run one check and act on the result.
    pub async fn poll_once(&mut self) -> Action {
        let observation = self.observe().await;
        debug!("Connectivity check: {}", observation);

        let action = self.machine.observe(observation);
        match action {
            Action::Idle => {
                if let ConnectivityState::InterfaceUpNoInternet(address) = observation {
                    warn!("Interface up with {} but no internet access", address);
                }
            }
            Action::Start { address, changed } => {
                if changed {
                    info!("Network connected, IP: {}", address);
                } else {
                    info!("Network reconnected, IP: {}", address);
                }
                if self.controller.is_running().await {
                    info!("Broadcaster already running");
                } else {
                    self.start().await;
                }
            }
            Action::EnsureRunning => {
                if !self.controller.is_running().await {
                    warn!("Broadcaster died unexpectedly, restarting");
                    self.start().await;
                }
            }
            Action::Stop { address_lost } => {
                if address_lost {
                    warn!("Network disconnected, stopping broadcaster");
                } else {
                    warn!("Internet connection lost, stopping broadcaster");
                }
                self.controller.stop().await;
            }
        }
        action
    }

    async fn start(&mut self) {
        match self.controller.start().await {
            Ok(StartOutcome::Started) => {}
            Ok(StartOutcome::AlreadyRunning) => debug!("Broadcaster was started elsewhere"),
            // Retried on the next tick while still connected.
            Err(e) => error!("Failed to start broadcaster: {}", e),
        }
    }

    /// Poll until `cancel` fires, then stop the broadcaster.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Supervising broadcaster, checking every {}s",
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
        }

        self.shutdown().await;
    }

    /// Stop the broadcaster regardless of state, bounded by `stop_limit`.
    pub async fn shutdown(&mut self) {
        info!("Supervisor shutting down, stopping broadcaster");
        if tokio::time::timeout(self.stop_limit, self.controller.stop())
            .await
            .is_err()
        {
            warn!(
                "Broadcaster stop did not finish within {}s",
                self.stop_limit.as_secs()
            );
        }
    }
}
