//! The seam between the session core and the platform BLE stack.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::gatt::ServiceDescriptor;
use crate::heart_rate::NotificationPayload;
use crate::{ConnectionEvent, Peripheral, PeripheralId, Result, Uuid};

/// Advertisements delivered by [`BleAdapter::request_scan`], in the order the stack reports them
pub type ScanStream = Pin<Box<dyn Stream<Item = Peripheral> + Send + 'static>>;

/// Values pushed by a peripheral after [`BleAdapter::start_notifications`]
pub type NotificationStream = Pin<Box<dyn Stream<Item = NotificationPayload> + Send + 'static>>;

/// Connection changes reported by [`BleAdapter::connection_events`]
pub type ConnectionEventStream = Pin<Box<dyn Stream<Item = ConnectionEvent> + Send + 'static>>;

/// Restricts which advertisements a scan reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// If not empty, only advertisements including at least one of these GATT services are reported
    pub services: Vec<Uuid>,
}

/// A Bluetooth LE central stack.
///
/// The session core issues only these calls. Every method may suspend until the stack answers; none of them is
/// bounded by a timeout on this side.
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Prepares the stack for use (powers on the radio, requests permissions, ...)
    async fn initialize(&self) -> Result<()>;

    /// Starts scanning for advertising peripherals.
    ///
    /// Duplicate advertisements may be reported. The stream ends once [`stop_scan`][Self::stop_scan] is called.
    async fn request_scan(&self, filter: &ScanFilter) -> Result<ScanStream>;

    /// Stops the current scan. Stopping when no scan is running is not an error.
    async fn stop_scan(&self) -> Result<()>;

    /// Establishes a connection to the peripheral
    async fn connect(&self, id: &PeripheralId) -> Result<()>;

    /// Closes the connection to the peripheral
    async fn disconnect(&self, id: &PeripheralId) -> Result<()>;

    /// Enumerates the primary services of a connected peripheral and their characteristics
    async fn services(&self, id: &PeripheralId) -> Result<Vec<ServiceDescriptor>>;

    /// Reads a characteristic value from a connected peripheral
    async fn read_characteristic(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Enables notifications for a characteristic and returns the stream of values pushed by the peripheral
    async fn start_notifications(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream>;

    /// Monitors a peripheral for connection and disconnection events
    async fn connection_events(&self, id: &PeripheralId) -> Result<ConnectionEventStream>;
}
