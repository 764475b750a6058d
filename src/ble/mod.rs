//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy plumbing behind the
//! [`DeviceManager`](crate::DeviceManager): the transport boundary and its
//! btleplug implementation, scanning, readiness checks, the connection
//! state machine, serialized writes and notification decoding.

pub mod codec;
pub mod connection;
pub mod notifications;
pub mod permissions;
pub mod platform;
pub mod readiness;
pub mod scanner;
pub(crate) mod session;
pub mod transport;
pub mod uuids;
pub mod write_queue;

pub use codec::{bytes_to_wire, wire_to_bytes, WireValue};
pub use connection::{ConnectionEvent, ConnectionState};
pub use notifications::NotificationPipeline;
pub use permissions::{HostPermissions, Permission, PermissionProvider, PermissionStatus, PermissionTier};
pub use platform::BtleplugTransport;
pub use readiness::ReadinessGate;
pub use scanner::BleScanner;
pub use transport::{AdapterState, DiscoveredDevice, NotificationFrame, PeripheralId, Transport};
pub use uuids::*;
pub use write_queue::{WriteQueue, WriteTarget};
