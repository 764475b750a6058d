//! BLE Service and Characteristic UUIDs.
//!
//! The tracker exposes one vendor data service with a write characteristic
//! for commands and a notify characteristic for responses. The values are
//! the same on every platform.

use uuid::Uuid;

/// Vendor data service UUID (`fff0`).
pub const DATA_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fff0_0000_1000_8000_00805f9b34fb);
/// Command characteristic UUID (`fff6`, write with response).
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_fff6_0000_1000_8000_00805f9b34fb);
/// Response characteristic UUID (`fff7`, notify).
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_fff7_0000_1000_8000_00805f9b34fb);
/// Client Characteristic Configuration descriptor UUID (`2902`).
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Short 16-bit alias of the data service, as it appears in advertisements.
pub const DATA_SERVICE_SHORT: u16 = 0xfff0;

/// Check if a service UUID is the tracker data service.
pub fn is_data_service(uuid: &Uuid) -> bool {
    *uuid == DATA_SERVICE_UUID
}
