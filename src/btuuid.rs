//! `Uuid` helpers for Bluetooth UUIDs and the GATT identifiers used by the session

use uuid::Uuid;

/// This is the Bluetooth Base UUID. It is used with 16-bit and 32-bit UUIDs
/// [defined](https://www.bluetooth.com/specifications/assigned-numbers/) by the Bluetooth SIG.
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Const function to create a 16-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u16(uuid: u16) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Returns the 16-bit alias of `uuid` if it is derived from the Bluetooth Base UUID
pub fn try_to_u16(uuid: &Uuid) -> Option<u16> {
    let u = uuid.as_u128();
    let is_u16 = (u & ((1 << 96) - 1)) == BLUETOOTH_BASE_UUID && (((u >> 96) as u32) & 0xffff0000) == 0;
    is_u16.then(|| (u >> 96) as u16)
}

/// Case-insensitive substring match against the hyphenated string form of `uuid`.
///
/// Platforms report UUIDs in whatever case they like, so `"180D"` and `"180d"` both match the Heart Rate service.
pub fn uuid_contains(uuid: &Uuid, fragment: &str) -> bool {
    uuid.hyphenated()
        .to_string()
        .contains(fragment.to_ascii_lowercase().as_str())
}

/// Bluetooth GATT Service 16-bit UUIDs
pub mod services {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const GENERIC_ACCESS: Uuid = bluetooth_uuid_from_u16(0x1800);
    pub const DEVICE_INFORMATION: Uuid = bluetooth_uuid_from_u16(0x180A);
    pub const HEART_RATE: Uuid = bluetooth_uuid_from_u16(0x180D);
    pub const BATTERY: Uuid = bluetooth_uuid_from_u16(0x180F);

    /// Services whose UUID contains this fragment get notification subscriptions instead of reads
    pub const HEART_RATE_FRAGMENT: &str = "180d";
}

/// Bluetooth GATT Characteristic 16-bit UUIDs
pub mod characteristics {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const DEVICE_NAME: Uuid = bluetooth_uuid_from_u16(0x2A00);
    pub const BATTERY_LEVEL: Uuid = bluetooth_uuid_from_u16(0x2A19);
    pub const MODEL_NUMBER_STRING: Uuid = bluetooth_uuid_from_u16(0x2A24);
    pub const SERIAL_NUMBER_STRING: Uuid = bluetooth_uuid_from_u16(0x2A25);
    pub const MANUFACTURER_NAME_STRING: Uuid = bluetooth_uuid_from_u16(0x2A29);
    pub const HEART_RATE_MEASUREMENT: Uuid = bluetooth_uuid_from_u16(0x2A37);
    pub const BODY_SENSOR_LOCATION: Uuid = bluetooth_uuid_from_u16(0x2A38);
}
