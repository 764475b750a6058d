//! Runtime permission handling.
//!
//! Mobile platforms gate scanning and connecting behind runtime permissions.
//! Newer Android releases (API 31+) need the scan, connect and location trio,
//! older ones only location. Desktop platforms need none.

use async_trait::async_trait;

/// A runtime permission needed for BLE access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Permission {
    /// Scan for nearby devices.
    BluetoothScan,
    /// Connect to paired or discovered devices.
    BluetoothConnect,
    /// Fine location, required by the platform for scanning.
    FineLocation,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BluetoothScan => write!(f, "BLUETOOTH_SCAN"),
            Self::BluetoothConnect => write!(f, "BLUETOOTH_CONNECT"),
            Self::FineLocation => write!(f, "ACCESS_FINE_LOCATION"),
        }
    }
}

/// Result of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// The user granted the permission.
    Granted,
    /// The user refused the permission.
    Denied,
    /// The user refused and asked not to be prompted again.
    NeverAskAgain,
}

impl PermissionStatus {
    /// Check if granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Which set of permissions the platform requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionTier {
    /// Scan, connect and location (Android 12 / API 31 and newer).
    Modern,
    /// Location only (Android 6 to 11).
    Legacy,
    /// No runtime permissions (desktop, iOS via Info.plist).
    NotRequired,
}

/// First Android API level with the split Bluetooth permissions.
pub const MODERN_PERMISSIONS_API_LEVEL: u32 = 31;

impl PermissionTier {
    /// Tier for an Android API level.
    pub fn for_api_level(api_level: u32) -> Self {
        if api_level >= MODERN_PERMISSIONS_API_LEVEL {
            Self::Modern
        } else {
            Self::Legacy
        }
    }

    /// Permissions required by this tier.
    pub fn required(&self) -> &'static [Permission] {
        match self {
            Self::Modern => &[
                Permission::BluetoothScan,
                Permission::BluetoothConnect,
                Permission::FineLocation,
            ],
            Self::Legacy => &[Permission::FineLocation],
            Self::NotRequired => &[],
        }
    }
}

/// Platform permission dialogs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// The tier that applies to the running platform.
    fn tier(&self) -> PermissionTier;

    /// Prompt the user for a permission.
    async fn request(&self, permission: Permission) -> PermissionStatus;

    /// Check a permission without prompting.
    async fn check(&self, permission: Permission) -> bool;
}

/// Provider for hosts without runtime permissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPermissions;

#[async_trait]
impl PermissionProvider for HostPermissions {
    fn tier(&self) -> PermissionTier {
        PermissionTier::NotRequired
    }

    async fn request(&self, _permission: Permission) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn check(&self, _permission: Permission) -> bool {
        true
    }
}
