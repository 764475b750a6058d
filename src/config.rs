//! Manager configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::{DATA_SERVICE_UUID, NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID};

/// Tunables for [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Service carrying the command and response characteristics.
    pub service_uuid: Uuid,
    /// Characteristic commands are written to.
    pub write_characteristic_uuid: Uuid,
    /// Characteristic responses are notified on.
    pub notify_characteristic_uuid: Uuid,
    /// Automatic reconnection attempts after an unexpected disconnect.
    pub reconnect_attempts: u32,
    /// Delay before each reconnection attempt.
    pub reconnect_delay: Duration,
    /// Adapter state poll interval during initialization.
    pub readiness_poll_interval: Duration,
    /// Adapter state polls before initialization gives up.
    pub readiness_poll_attempts: u32,
    /// How long scan and connect wait for the adapter to power on.
    pub powered_on_wait: Duration,
    /// Capacity of the broadcast channels.
    pub event_capacity: usize,
}

impl ManagerConfig {
    /// Default number of automatic reconnection attempts.
    pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 2;

    /// Set the GATT layout.
    pub fn with_uuids(mut self, service: Uuid, write: Uuid, notify: Uuid) -> Self {
        self.service_uuid = service;
        self.write_characteristic_uuid = write;
        self.notify_characteristic_uuid = notify;
        self
    }

    /// Set the reconnection parameters.
    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    /// Set the initialization polling parameters.
    pub fn with_readiness_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.readiness_poll_interval = interval;
        self.readiness_poll_attempts = attempts;
        self
    }

    /// Set the powered-on wait used by scan and connect.
    pub fn with_powered_on_wait(mut self, wait: Duration) -> Self {
        self.powered_on_wait = wait;
        self
    }

    /// Total time initialization may spend polling the adapter.
    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_poll_interval * self.readiness_poll_attempts
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service_uuid: DATA_SERVICE_UUID,
            write_characteristic_uuid: WRITE_CHARACTERISTIC_UUID,
            notify_characteristic_uuid: NOTIFY_CHARACTERISTIC_UUID,
            reconnect_attempts: Self::DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_secs(1),
            readiness_poll_interval: Duration::from_millis(500),
            readiness_poll_attempts: 10,
            powered_on_wait: Duration::from_secs(3),
            event_capacity: 64,
        }
    }
}
