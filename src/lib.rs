// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # wearable-ble
//!
//! Connection and transport manager for Bluetooth Low Energy fitness
//! trackers.
//!
//! The crate owns the single connection to a wearable: it checks
//! permissions and adapter readiness, scans for named peripherals, connects
//! and subscribes to the tracker's notify characteristic, reconnects a
//! bounded number of times after unexpected drops, serializes command
//! writes and publishes decoded and raw inbound frames on an event bus.
//!
//! The tracker's own protocol stays outside the crate. Plug in a
//! [`ProtocolCodec`] to decode frames and encode commands; the bundled
//! [`RawFrameCodec`] tags frames with their leading command byte.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wearable_ble::{BleEvent, DeviceManager, EventKind, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::new().await?;
//!     if !manager.initialize().await {
//!         return Ok(());
//!     }
//!
//!     let _data = manager.on(EventKind::DataReceived, |event| {
//!         if let BleEvent::DataReceived(message) = event {
//!             println!("{}: {}", message.data_type, message.payload);
//!         }
//!     });
//!
//!     manager.connect_by_id("AA:BB:CC:DD:EE:FF").await?;
//!     manager.send_command("0x10", &[0x01])?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     manager.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ### Android
//! Runtime permissions are supplied through a [`PermissionProvider`]; see
//! [`PermissionTier`] for what each API level requires.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration

// Public modules
pub mod ble;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod events;
pub mod protocol;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use device_manager::DeviceManager;
pub use error::{Error, Result};
pub use events::{BleEvent, CallbackHandle, EventBus, EventKind, ListenerId};
pub use protocol::{DecodedMessage, ProtocolCodec, ProtocolError, RawFrameCodec};
pub use utils::{parse_hex_bytes, to_hex_string};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionEvent, ConnectionState};
pub use ble::permissions::{Permission, PermissionProvider, PermissionStatus, PermissionTier};
pub use ble::transport::{AdapterState, DiscoveredDevice, PeripheralId, Transport};
