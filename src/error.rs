//! Error types for the wearable-ble crate.

use thiserror::Error;

use crate::ble::permissions::Permission;
use crate::ble::transport::AdapterState;
use crate::protocol::ProtocolError;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available on this system.
    #[error("Bluetooth not available")]
    BluetoothUnavailable,

    /// The adapter did not reach the powered-on state.
    #[error("Bluetooth adapter not ready: {state}")]
    AdapterNotReady {
        /// Last adapter state observed.
        state: AdapterState,
    },

    /// One or more runtime permissions were refused.
    #[error("Permission denied: {}", format_permissions(.permissions))]
    PermissionDenied {
        /// The permissions that were not granted.
        permissions: Vec<Permission>,
    },

    /// The requested peripheral is neither cached nor known to the transport.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connected session.
    #[error("Device not connected")]
    NotConnected,

    /// Another connection attempt is still running.
    #[error("Connection already in progress (requested {identifier})")]
    ConnectionInProgress {
        /// The identifier of the rejected request.
        identifier: String,
    },

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A transport operation failed.
    #[error("Transport error during {operation}: {reason}")]
    Transport {
        /// The operation that failed.
        operation: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// The protocol codec rejected a frame or command.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The write queue of the session has shut down.
    #[error("Write queue closed")]
    QueueClosed,
}

impl Error {
    /// Shorthand for a [`Error::Transport`] value.
    pub fn transport(operation: &'static str, reason: impl ToString) -> Self {
        Self::Transport {
            operation,
            reason: reason.to_string(),
        }
    }
}

fn format_permissions(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
