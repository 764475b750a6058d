//! Transport boundary between the manager and a native BLE binding.
//!
//! Everything the manager needs from the platform goes through the
//! [`Transport`] trait, so the connection logic can run against btleplug in
//! production and against an in-memory fake in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::ble::codec::WireValue;
use crate::error::Result;

/// Power/authorization state reported by the Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// State not yet known.
    #[default]
    Unknown,
    /// Adapter is resetting.
    Resetting,
    /// Hardware has no BLE support.
    Unsupported,
    /// The application is not allowed to use Bluetooth.
    Unauthorized,
    /// Bluetooth is switched off.
    PoweredOff,
    /// Bluetooth is on and usable.
    PoweredOn,
}

impl AdapterState {
    /// Check if the adapter is usable.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// Check if the adapter can never become usable without user action.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unsupported | Self::Unauthorized)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Opaque platform-assigned peripheral identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create an identifier from its platform string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeripheralId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A peripheral observed during a scan or resolved by identifier.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Platform identifier.
    pub id: PeripheralId,
    /// Device name held by the platform (GAP name).
    pub name: Option<String>,
    /// Local name from the advertisement payload.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// When this advertisement was observed.
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Create a device record observed now.
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            local_name: None,
            rssi: None,
            last_seen: Utc::now(),
        }
    }

    /// Set the device name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the advertised local name.
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Set the RSSI.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// The first non-empty name, local name first.
    pub fn display_name(&self) -> Option<&str> {
        self.local_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.name.as_deref().filter(|n| !n.is_empty()))
    }

    /// Whether the advertisement carries a usable name.
    pub fn is_named(&self) -> bool {
        self.display_name().is_some()
    }
}

/// One inbound frame from a monitored characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationFrame {
    /// A value was delivered.
    Value(WireValue),
    /// The notification carried no value.
    Empty,
    /// The binding reported an error for this notification.
    Error(String),
}

/// Native BLE binding used by the manager.
///
/// Peripherals are addressed by [`PeripheralId`]; implementations keep
/// whatever platform handles they need internally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Query the current adapter state.
    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Stream of adapter state changes.
    async fn adapter_state_changes(&self) -> Result<BoxStream<'static, AdapterState>>;

    /// Start device discovery and stream every advertisement observed.
    async fn start_discovery(&self) -> Result<BoxStream<'static, DiscoveredDevice>>;

    /// Stop device discovery. Must succeed when discovery is not running.
    async fn stop_discovery(&self) -> Result<()>;

    /// Look a peripheral up directly by identifier.
    async fn find_peripheral(&self, id: &PeripheralId) -> Result<Option<DiscoveredDevice>>;

    /// Open the link-level connection.
    async fn connect(&self, id: &PeripheralId) -> Result<()>;

    /// Cancel the link-level connection.
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()>;

    /// Discover services and return their UUIDs.
    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Uuid>>;

    /// Return the characteristic UUIDs of a discovered service.
    async fn discover_characteristics(&self, id: &PeripheralId, service: Uuid) -> Result<Vec<Uuid>>;

    /// Subscribe to a characteristic and stream its notifications.
    ///
    /// Dropping the stream releases the subscription.
    async fn monitor(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, NotificationFrame>>;

    /// Write a value with response.
    async fn write_with_response(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: WireValue,
    ) -> Result<()>;

    /// Stream yielding once per link-level disconnection of the peripheral.
    async fn disconnections(&self, id: &PeripheralId) -> Result<BoxStream<'static, ()>>;
}
