//! Heart Rate Measurement decoding.
//!
//! Layout of the characteristic value (Heart Rate Service, §3.1.1):
//!
//! | offset | field                                                   |
//! |--------|---------------------------------------------------------|
//! | 0      | flags                                                   |
//! | 1      | heart rate, `u8`, or low byte of a `u16` (little-endian) |
//! | 2      | high byte of the heart rate when [`RATE_U16`] is set    |
//!
//! Everything after the heart rate (energy expended, RR intervals) is ignored.
//!
//! [`RATE_U16`]: MeasurementFlags::RATE_U16

use base64::prelude::BASE64_STANDARD;
use base64::Engine;

bitflags::bitflags! {
    /// Flags byte of a Heart Rate Measurement
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MeasurementFlags: u8 {
        /// Heart rate value is a `u16` instead of a `u8`
        const RATE_U16 = 1 << 0;
        /// Sensor contact detected
        const SENSOR_CONTACT_STATUS = 1 << 1;
        /// Sensor contact feature supported
        const SENSOR_CONTACT_SUPPORT = 1 << 2;
        /// Energy expended field present
        const ENERGY_EXPENDED = 1 << 3;
        /// One or more RR interval fields present
        const RR_INTERVAL = 1 << 4;
    }
}

/// How the heart rate value is located in a measurement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HeartRateFormat {
    /// Always read the single byte at offset 1, whatever the flags say.
    ///
    /// Compatible with scanners that never looked at the flags byte. Values above 255 bpm sent as `u16` come out
    /// as their low byte.
    Legacy,
    /// Read a `u8` or a little-endian `u16` at offset 1 depending on [`MeasurementFlags::RATE_U16`]
    #[default]
    Flags,
}

/// A decoded heart rate notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeartRateSample {
    /// Beats per minute
    pub beats_per_minute: u16,
}

impl std::fmt::Display for HeartRateSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bpm", self.beats_per_minute)
    }
}

/// A malformed notification payload
#[derive(Debug, displaydoc::Display, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// empty payload
    Empty,
    /// payload truncated: need {needed} bytes, got {len}
    Truncated {
        /// bytes required by the flags
        needed: usize,
        /// bytes received
        len: usize,
    },
    /// invalid base64 payload: {0}
    Base64(base64::DecodeError),
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Base64(err) => Some(err),
            _ => None,
        }
    }
}

/// A notification value as delivered by a [`BleAdapter`][crate::BleAdapter].
///
/// Native stacks hand over raw bytes. Bridged stacks (webviews, mobile plugin layers) deliver values as base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotificationPayload {
    /// Raw characteristic value
    Bytes(Vec<u8>),
    /// Base64 encoded characteristic value
    Base64(String),
}

impl NotificationPayload {
    /// Returns the raw characteristic value
    pub fn into_bytes(self) -> Result<Vec<u8>, DecodeError> {
        match self {
            NotificationPayload::Bytes(bytes) => Ok(bytes),
            NotificationPayload::Base64(text) => BASE64_STANDARD.decode(text.trim()).map_err(DecodeError::Base64),
        }
    }

    /// Decodes this payload as a Heart Rate Measurement
    pub fn decode(self, format: HeartRateFormat) -> Result<HeartRateSample, DecodeError> {
        decode(&self.into_bytes()?, format)
    }
}

impl From<Vec<u8>> for NotificationPayload {
    fn from(bytes: Vec<u8>) -> Self {
        NotificationPayload::Bytes(bytes)
    }
}

/// Decodes a raw Heart Rate Measurement value
pub fn decode(value: &[u8], format: HeartRateFormat) -> Result<HeartRateSample, DecodeError> {
    let flags = MeasurementFlags::from_bits_retain(*value.first().ok_or(DecodeError::Empty)?);
    let wide = format == HeartRateFormat::Flags && flags.contains(MeasurementFlags::RATE_U16);
    let needed = if wide { 3 } else { 2 };
    if value.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            len: value.len(),
        });
    }

    let beats_per_minute = if wide {
        u16::from_le_bytes([value[1], value[2]])
    } else {
        u16::from(value[1])
    };
    Ok(HeartRateSample { beats_per_minute })
}

/// Decodes a base64 encoded Heart Rate Measurement value
pub fn decode_base64(payload: &str, format: HeartRateFormat) -> Result<HeartRateSample, DecodeError> {
    NotificationPayload::Base64(payload.to_owned()).decode(format)
}
