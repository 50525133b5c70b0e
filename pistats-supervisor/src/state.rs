//! Supervisor state machine.
//!
//! Pure transition logic: one connectivity observation in, one action out.
//! Side effects live in [`crate::monitor`].

use std::fmt;
use std::net::Ipv4Addr;

/// What a single connectivity check found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No usable address on the interface.
    NoInterface,
    /// The interface has an address but the internet is unreachable.
    InterfaceUpNoInternet(Ipv4Addr),
    /// Address present and internet reachable.
    Connected(Ipv4Addr),
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoInterface => write!(f, "no interface address"),
            Self::InterfaceUpNoInternet(ip) => write!(f, "{} without internet", ip),
            Self::Connected(ip) => write!(f, "connected as {}", ip),
        }
    }
}

/// Supervisor link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connected,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    Idle,
    /// Connectivity (re)gained: start the broadcaster if it is not running.
    Start { address: Ipv4Addr, changed: bool },
    /// Still connected: restart the broadcaster if it died.
    EnsureRunning,
    /// Connectivity lost: stop the broadcaster.
    Stop { address_lost: bool },
}

/// Tracks link state and the last address seen while connected.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: LinkState,
    last_address: Option<Ipv4Addr>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn last_address(&self) -> Option<Ipv4Addr> {
        self.last_address
    }

    /// Apply one observation.
    ///
    /// Losing internet keeps the last address so a reconnect on the same
    /// address is not reported as a change. Losing the address clears it.
    pub fn observe(&mut self, observation: ConnectivityState) -> Action {
        match (self.state, observation) {
            (LinkState::Disconnected, ConnectivityState::Connected(address)) => {
                let changed = self.last_address != Some(address);
                self.state = LinkState::Connected;
                self.last_address = Some(address);
                Action::Start { address, changed }
            }
            (LinkState::Connected, ConnectivityState::Connected(address)) => {
                if self.last_address == Some(address) {
                    Action::EnsureRunning
                } else {
                    self.last_address = Some(address);
                    Action::Start {
                        address,
                        changed: true,
                    }
                }
            }
            (LinkState::Connected, ConnectivityState::InterfaceUpNoInternet(_)) => {
                self.state = LinkState::Disconnected;
                Action::Stop {
                    address_lost: false,
                }
            }
            (LinkState::Connected, ConnectivityState::NoInterface) => {
                self.state = LinkState::Disconnected;
                self.last_address = None;
                Action::Stop { address_lost: true }
            }
            (LinkState::Disconnected, _) => Action::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const OTHER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 101);

    #[test]
    fn test_connect_starts() {
        let mut machine = StateMachine::new();

        assert_eq!(
            machine.observe(ConnectivityState::Connected(ADDR)),
            Action::Start {
                address: ADDR,
                changed: true
            }
        );
        assert_eq!(machine.state(), LinkState::Connected);
        assert_eq!(machine.last_address(), Some(ADDR));
    }

    #[test]
    fn test_steady_connection() {
        let mut machine = StateMachine::new();
        machine.observe(ConnectivityState::Connected(ADDR));

        assert_eq!(
            machine.observe(ConnectivityState::Connected(ADDR)),
            Action::EnsureRunning
        );
        assert_eq!(machine.state(), LinkState::Connected);
    }

    #[test]
    fn test_internet_loss_keeps_address() {
        let mut machine = StateMachine::new();
        machine.observe(ConnectivityState::Connected(ADDR));

        assert_eq!(
            machine.observe(ConnectivityState::InterfaceUpNoInternet(ADDR)),
            Action::Stop {
                address_lost: false
            }
        );
        assert_eq!(machine.state(), LinkState::Disconnected);
        assert_eq!(machine.last_address(), Some(ADDR));

        // Same address again is not a change.
        assert_eq!(
            machine.observe(ConnectivityState::Connected(ADDR)),
            Action::Start {
                address: ADDR,
                changed: false
            }
        );
    }

    #[test]
    fn test_address_loss_clears_address() {
        let mut machine = StateMachine::new();
        machine.observe(ConnectivityState::Connected(ADDR));

        assert_eq!(
            machine.observe(ConnectivityState::NoInterface),
            Action::Stop { address_lost: true }
        );
        assert_eq!(machine.last_address(), None);
    }

    #[test]
    fn test_disconnected_stays_idle() {
        let mut machine = StateMachine::new();

        assert_eq!(machine.observe(ConnectivityState::NoInterface), Action::Idle);
        assert_eq!(
            machine.observe(ConnectivityState::InterfaceUpNoInternet(ADDR)),
            Action::Idle
        );
        assert_eq!(machine.state(), LinkState::Disconnected);
        assert_eq!(machine.last_address(), None);
    }

    #[test]
    fn test_address_change_while_connected() {
        let mut machine = StateMachine::new();
        machine.observe(ConnectivityState::Connected(ADDR));

        assert_eq!(
            machine.observe(ConnectivityState::Connected(OTHER)),
            Action::Start {
                address: OTHER,
                changed: true
            }
        );
        assert_eq!(machine.state(), LinkState::Connected);
        assert_eq!(machine.last_address(), Some(OTHER));
    }

    #[test]
    fn test_reconnect_on_new_address() {
        let mut machine = StateMachine::new();
        machine.observe(ConnectivityState::Connected(ADDR));
        machine.observe(ConnectivityState::InterfaceUpNoInternet(ADDR));

        assert_eq!(
            machine.observe(ConnectivityState::Connected(OTHER)),
            Action::Start {
                address: OTHER,
                changed: true
            }
        );
        assert_eq!(machine.last_address(), Some(OTHER));
    }
}
