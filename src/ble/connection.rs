//! Connection state machine.
//!
//! [`ConnectionState::next`] is the transition table of a single peripheral
//! session; [`ReconnectTracker`] decides what a lost link leads to. Both are
//! plain data so the lifecycle rules can be checked without a transport.

use std::time::Duration;

use crate::ble::transport::PeripheralId;

/// Connection state of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session.
    #[default]
    Disconnected,
    /// Opening the link-level connection.
    Connecting,
    /// Link is up, locating the data service and subscribing.
    Discovering,
    /// Session fully set up.
    Connected,
    /// Link lost, waiting to retry.
    Reconnecting,
    /// Session released by a manual disconnect or shutdown.
    TornDown,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt starts.
    ConnectRequested,
    /// The link-level connection is open.
    LinkEstablished,
    /// Notification subscription is active.
    SubscriptionReady,
    /// Connecting, discovery or the live link failed; `retry` carries the
    /// reconnect decision.
    LinkLost {
        /// Whether a reconnection attempt was scheduled.
        retry: bool,
    },
    /// The peripheral to connect to could not be resolved.
    TargetNotFound,
    /// Manual disconnect or teardown.
    DisconnectRequested,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Reconnecting)
    }

    /// Transition table. `None` means the event is not valid in this state.
    pub fn next(self, event: LinkEvent) -> Option<Self> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self, event) {
            (_, DisconnectRequested) => Some(TornDown),
            (Disconnected | TornDown | Reconnecting, ConnectRequested) => Some(Connecting),
            (Connecting, LinkEstablished) => Some(Discovering),
            (Discovering, SubscriptionReady) => Some(Connected),
            (Connecting | Discovering | Connected, LinkLost { retry: true }) => Some(Reconnecting),
            (Connecting | Discovering | Connected, LinkLost { retry: false }) => Some(Disconnected),
            (TornDown, TargetNotFound) => Some(Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The identifier of the peripheral, if a session target exists.
    pub identifier: Option<PeripheralId>,
    /// The new connection state.
    pub state: ConnectionState,
}

/// What to do after the link was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Retry after `delay`; `attempt` counts from 1.
    Reconnect {
        /// Attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// Give up and release the session.
    Cleanup,
}

/// Manual-disconnect flag and bounded reconnect counter of a session.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    max_attempts: u32,
    delay: Duration,
    attempts: u32,
    manual: bool,
}

impl ReconnectTracker {
    /// Create a tracker allowing `max_attempts` consecutive reconnects.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
            manual: false,
        }
    }

    /// Mark the disconnect as user requested. Suppresses reconnection.
    pub fn mark_manual(&mut self) {
        self.manual = true;
    }

    /// Check if a manual disconnect was requested.
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// Reconnect attempts used so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A user-initiated connect starts with a fresh budget.
    pub fn begin(&mut self) {
        self.manual = false;
        self.attempts = 0;
    }

    /// The session came up. The counter is kept so a flapping link still
    /// runs out of attempts; only [`begin`](Self::begin) refills it.
    pub fn on_connected(&mut self) {
        self.manual = false;
    }

    /// Decide what a lost link leads to.
    pub fn on_link_lost(&mut self) -> Recovery {
        if !self.manual && self.attempts < self.max_attempts {
            self.attempts += 1;
            Recovery::Reconnect {
                attempt: self.attempts,
                delay: self.delay,
            }
        } else {
            self.attempts = 0;
            self.manual = true;
            Recovery::Cleanup
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Discovering.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Reconnecting.is_transitioning());
        assert!(!ConnectionState::TornDown.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::TornDown), "TornDown");
    }

    #[test]
    fn test_happy_path() {
        let state = ConnectionState::Disconnected
            .next(LinkEvent::ConnectRequested)
            .and_then(|s| s.next(LinkEvent::LinkEstablished))
            .and_then(|s| s.next(LinkEvent::SubscriptionReady));
        assert_eq!(state, Some(ConnectionState::Connected));
    }

    #[test]
    fn test_lost_link_paths() {
        let connected = ConnectionState::Connected;
        assert_eq!(
            connected.next(LinkEvent::LinkLost { retry: true }),
            Some(ConnectionState::Reconnecting)
        );
        assert_eq!(
            connected.next(LinkEvent::LinkLost { retry: false }),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(
            ConnectionState::Reconnecting.next(LinkEvent::ConnectRequested),
            Some(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(ConnectionState::Disconnected.next(LinkEvent::SubscriptionReady), None);
        assert_eq!(ConnectionState::Connected.next(LinkEvent::ConnectRequested), None);
        assert_eq!(ConnectionState::Connecting.next(LinkEvent::SubscriptionReady), None);
        assert_eq!(
            ConnectionState::Disconnected.next(LinkEvent::LinkLost { retry: true }),
            None
        );
    }

    #[test]
    fn test_failed_lookup_after_teardown_settles() {
        assert_eq!(
            ConnectionState::TornDown.next(LinkEvent::TargetNotFound),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(ConnectionState::Connected.next(LinkEvent::TargetNotFound), None);
        assert_eq!(ConnectionState::Disconnected.next(LinkEvent::TargetNotFound), None);
    }

    #[test]
    fn test_teardown_from_any_state() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Discovering,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::TornDown,
        ] {
            assert_eq!(
                state.next(LinkEvent::DisconnectRequested),
                Some(ConnectionState::TornDown)
            );
        }
    }

    #[test]
    fn test_reconnect_budget_is_bounded() {
        let delay = Duration::from_secs(1);
        let mut tracker = ReconnectTracker::new(2, delay);

        assert_eq!(tracker.on_link_lost(), Recovery::Reconnect { attempt: 1, delay });
        assert_eq!(tracker.on_link_lost(), Recovery::Reconnect { attempt: 2, delay });
        assert_eq!(tracker.on_link_lost(), Recovery::Cleanup);
        assert!(tracker.is_manual());
        assert_eq!(tracker.attempts(), 0);
    }

    #[test]
    fn test_reconnect_success_keeps_budget() {
        let mut tracker = ReconnectTracker::new(2, Duration::from_secs(1));
        tracker.on_link_lost();
        tracker.on_connected();
        tracker.on_link_lost();
        tracker.on_connected();

        assert_eq!(tracker.on_link_lost(), Recovery::Cleanup);
    }

    #[test]
    fn test_user_connect_refills_budget() {
        let mut tracker = ReconnectTracker::new(2, Duration::from_secs(1));
        tracker.on_link_lost();
        tracker.on_link_lost();
        tracker.mark_manual();
        tracker.begin();

        assert!(!tracker.is_manual());
        assert!(matches!(tracker.on_link_lost(), Recovery::Reconnect { attempt: 1, .. }));
    }

    #[test]
    fn test_manual_disconnect_suppresses_reconnect() {
        let mut tracker = ReconnectTracker::new(2, Duration::from_secs(1));
        tracker.mark_manual();
        assert_eq!(tracker.on_link_lost(), Recovery::Cleanup);
        assert_eq!(tracker.on_link_lost(), Recovery::Cleanup);
    }
}
