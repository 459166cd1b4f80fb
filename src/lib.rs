#![warn(missing_docs)]

//! Blescan is the session core of a [Bluetooth Low Energy] (BLE) scanner for [Rust]. It discovers nearby
//! peripherals, optionally auto-connects to a peripheral advertising a target name, reads the Device Information
//! service, and drains every readable characteristic of the connected peripheral, subscribing to Heart Rate
//! notifications along the way.
//!
//! Blescan does no radio I/O of its own. Everything it does goes through a [`BleAdapter`], a thin async trait over
//! the platform's BLE stack. A BlueZ implementation is available on Linux behind the `bluer` feature.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use std::sync::Arc;
//!# use blescan::{BleAdapter, Session, SessionConfig};
//!# use futures_lite::StreamExt;
//!# async fn run(adapter: Arc<dyn BleAdapter>) -> blescan::Result<()> {
//!let config = SessionConfig::default().with_target_name("Evolve3_4260");
//!let session = Session::start(adapter, config).await?;
//!
//!let mut events = session.events();
//!while let Some(event) = events.next().await {
//!    println!("{:?}", event);
//!}
//!
//!session.shutdown().await;
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! The session is assembled from small components which can also be used on their own:
//!
//! - [`DeviceRegistry`]: deduplicated, insertion-ordered list of discovered peripherals
//! - [`ScanSession`]: one bounded scan with timeout and auto-connect trigger
//! - [`ConnectionManager`]: connected set plus the single in-flight pairing attempt
//! - [`GattReader`]: exhaustive per-characteristic reads with failure isolation
//! - [`heart_rate`]: decoding of Heart Rate Measurement notifications
//! - [`Session`]: the coordinator wiring all of the above together
//!
//! # Feature flags
//!
//! The `serde` feature enables serializing/deserializing peripheral identifiers and [`SessionConfig`].
//!
//! The `bluer` feature enables [`bluer::BluerAdapter`], a [`BleAdapter`] backed by BlueZ (Linux only).

pub mod adapter;
pub mod btuuid;
pub mod config;
pub mod connection;
pub mod error;
pub mod gatt;
pub mod heart_rate;
pub mod registry;
pub mod scan;
pub mod session;

#[cfg(all(target_os = "linux", feature = "bluer"))]
pub mod bluer;

pub use adapter::{BleAdapter, ConnectionEventStream, NotificationStream, ScanFilter, ScanStream};
pub use config::SessionConfig;
pub use connection::{ConnectOutcome, ConnectionManager, ConnectionState};
pub use error::Error;
pub use gatt::{
    CharacteristicDescriptor, DeviceInfo, GattReader, HeartRateSubscription, ReadCycle, ReadOutcome, ReadResult,
    ServiceDescriptor, Value,
};
pub use heart_rate::{HeartRateFormat, HeartRateSample, NotificationPayload};
pub use registry::DeviceRegistry;
pub use scan::{ScanEvent, ScanHandle, ScanSession, StopReason};
pub use session::{Session, SessionEvent};
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// An opaque, platform-specific peripheral identifier.
///
/// On Linux this is the Bluetooth address, on Apple platforms a per-application UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Creates an identifier from its platform string form
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
    }

    /// The platform string form of this identifier
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
    fn from(id: &str) -> Self {
        PeripheralId::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

/// A peripheral seen during a scan.
///
/// Identity is [`id`][Peripheral::id]; the advertised name may be missing or shared by several peripherals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Peripheral {
    /// The platform identifier of the peripheral
    pub id: PeripheralId,
    /// The (possibly shortened) advertised local name
    pub name: Option<String>,
}

impl Peripheral {
    /// Creates a peripheral reference
    pub fn new(id: impl Into<PeripheralId>, name: Option<String>) -> Self {
        Peripheral { id: id.into(), name }
    }

    /// The advertised name, or the identifier when the peripheral did not advertise one
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

impl std::fmt::Display for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "(unknown) ({})", self.id),
        }
    }
}

/// The subset of GATT characteristic properties consulted when draining a peripheral.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicProperties {
    /// The characteristic value may be read
    pub read: bool,
    /// The characteristic value may be pushed to the central as a notification
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Collapses the raw GATT properties bitfield (Core Specification, Vol 3, Part G, §3.3.1.1).
    ///
    /// Indications are treated as notifications.
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            read: (bits & (1 << 1)) != 0,
            notify: (bits & ((1 << 4) | (1 << 5))) != 0,
        }
    }
}

/// Connection state changes reported by a [`BleAdapter`] for a single peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionEvent {
    /// The peripheral is now connected
    Connected,
    /// The peripheral disconnected, whether requested or not
    Disconnected,
}
