//! Draining the GATT database of a connected peripheral.

use std::sync::Arc;

use futures_lite::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::btuuid::{self, characteristics, services};
use crate::error::ErrorKind;
use crate::heart_rate::{HeartRateFormat, HeartRateSample};
use crate::{BleAdapter, CharacteristicProperties, Error, NotificationStream, PeripheralId, Result, Uuid};

/// Placeholder stored in [`DeviceInfo`] fields whose read failed
pub const READ_FAILED: &str = "[Read Failed]";

/// A GATT characteristic as enumerated from the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicDescriptor {
    /// The [`Uuid`] identifying the type of this characteristic
    pub uuid: Uuid,
    /// What may be done with the characteristic
    pub properties: CharacteristicProperties,
}

impl CharacteristicDescriptor {
    /// Creates a characteristic descriptor
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        CharacteristicDescriptor { uuid, properties }
    }
}

/// A GATT service and its characteristics, in the order the peripheral reported them.
///
/// Taken fresh for every read cycle; never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    /// The [`Uuid`] identifying the type of this service
    pub uuid: Uuid,
    /// Characteristics of the service in enumeration order
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// Creates a service descriptor
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicDescriptor>) -> Self {
        ServiceDescriptor { uuid, characteristics }
    }

    /// `true` for the Heart Rate service, whose notify-only characteristics are subscribed to
    pub fn is_heart_rate(&self) -> bool {
        btuuid::uuid_contains(&self.uuid, services::HEART_RATE_FRAGMENT)
    }
}

/// A successfully obtained characteristic value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Raw value returned by a read
    Bytes(Vec<u8>),
    /// Decoded heart rate notification
    HeartRate(HeartRateSample),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) if !text.chars().any(char::is_control) => f.write_str(text),
                _ => {
                    for (i, b) in bytes.iter().enumerate() {
                        if i > 0 {
                            f.write_str(" ")?;
                        }
                        write!(f, "{:02x}", b)?;
                    }
                    Ok(())
                }
            },
            Value::HeartRate(sample) => write!(f, "{}", sample.beats_per_minute),
        }
    }
}

/// What happened when a characteristic was read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReadOutcome {
    /// The characteristic produced a value
    Value(Value),
    /// The read succeeded but the value was empty
    Empty,
    /// The read failed; carries the error message
    Failed(String),
}

impl ReadOutcome {
    /// `true` for [`ReadOutcome::Failed`]
    pub fn is_failed(&self) -> bool {
        matches!(self, ReadOutcome::Failed(_))
    }
}

impl std::fmt::Display for ReadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadOutcome::Value(value) => write!(f, "{}", value),
            ReadOutcome::Empty => f.write_str("[No data]"),
            ReadOutcome::Failed(message) => write!(f, "[Error: {}]", message),
        }
    }
}

/// The outcome of reading one characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadResult {
    /// The service owning the characteristic
    pub service: Uuid,
    /// The characteristic read
    pub characteristic: Uuid,
    /// What the read produced
    pub outcome: ReadOutcome,
}

impl std::fmt::Display for ReadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}: {}", self.service, self.characteristic, self.outcome)
    }
}

/// Manufacturer, model and serial number from the Device Information service.
///
/// Each field is read independently; a field whose read failed holds [`READ_FAILED`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Manufacturer Name String (0x2A29)
    pub manufacturer: String,
    /// Model Number String (0x2A24)
    pub model: String,
    /// Serial Number String (0x2A25)
    pub serial: String,
}

/// A live heart rate notification subscription started by [`GattReader::read_all`].
///
/// Yields one [`ReadResult`] per notification until the peripheral stops sending or the stream is dropped.
pub struct HeartRateSubscription {
    service: Uuid,
    characteristic: Uuid,
    format: HeartRateFormat,
    notifications: NotificationStream,
}

impl std::fmt::Debug for HeartRateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartRateSubscription")
            .field("service", &self.service)
            .field("characteristic", &self.characteristic)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl HeartRateSubscription {
    /// The subscribed service
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// The subscribed characteristic
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Waits for the next notification and decodes it.
    ///
    /// A malformed payload produces a [`ReadOutcome::Failed`] result rather than ending the subscription.
    pub async fn next(&mut self) -> Option<ReadResult> {
        let payload = self.notifications.next().await?;
        let outcome = match payload.decode(self.format) {
            Ok(sample) => {
                info!("heart rate: {}", sample);
                ReadOutcome::Value(Value::HeartRate(sample))
            }
            Err(err) => {
                warn!("malformed heart rate notification on {}: {}", self.characteristic, err);
                ReadOutcome::Failed(Error::from(err).to_string())
            }
        };
        Some(ReadResult {
            service: self.service,
            characteristic: self.characteristic,
            outcome,
        })
    }
}

/// The product of one [`GattReader::read_all`] pass
#[derive(Debug, Default)]
pub struct ReadCycle {
    /// Number of services the peripheral reported
    pub services: usize,
    /// One result per readable characteristic, in enumeration order
    pub results: Vec<ReadResult>,
    /// Heart rate subscriptions started during the pass, in enumeration order
    pub subscriptions: Vec<HeartRateSubscription>,
}

/// Reads every characteristic of a connected peripheral.
#[derive(Clone)]
pub struct GattReader {
    adapter: Arc<dyn BleAdapter>,
    format: HeartRateFormat,
}

impl std::fmt::Debug for GattReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattReader").field("format", &self.format).finish_non_exhaustive()
    }
}

impl GattReader {
    /// Creates a reader decoding heart rate notifications with `format`
    pub fn new(adapter: Arc<dyn BleAdapter>, format: HeartRateFormat) -> Self {
        GattReader { adapter, format }
    }

    /// Reads one characteristic, folding failures into the outcome
    pub async fn read(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid) -> ReadOutcome {
        match self.adapter.read_characteristic(id, service, characteristic).await {
            Ok(value) if value.is_empty() => ReadOutcome::Empty,
            Ok(value) => ReadOutcome::Value(Value::Bytes(value)),
            Err(err) => {
                let err = err.context(ErrorKind::CharacteristicRead, "");
                warn!("reading {} / {} failed: {}", service, characteristic, err);
                ReadOutcome::Failed(err.to_string())
            }
        }
    }

    /// Walks every service and characteristic of the peripheral in enumeration order.
    ///
    /// Readable characteristics are read. Notify-only characteristics of the Heart Rate service are subscribed to
    /// instead. Everything else is skipped without a result.
    ///
    /// Only a failure to enumerate services aborts the pass; failed reads and subscriptions are reported in place.
    pub async fn read_all(&self, id: &PeripheralId) -> Result<ReadCycle> {
        let services = self
            .adapter
            .services(id)
            .await
            .map_err(|err| err.context(ErrorKind::ServiceEnumeration, format!("enumerating services of {}", id)))?;
        debug!("{} services on {}", services.len(), id);

        let mut cycle = ReadCycle {
            services: services.len(),
            ..ReadCycle::default()
        };
        for service in &services {
            for characteristic in &service.characteristics {
                if characteristic.properties.read {
                    let outcome = self.read(id, service.uuid, characteristic.uuid).await;
                    cycle.results.push(ReadResult {
                        service: service.uuid,
                        characteristic: characteristic.uuid,
                        outcome,
                    });
                } else if characteristic.properties.notify && service.is_heart_rate() {
                    match self
                        .adapter
                        .start_notifications(id, service.uuid, characteristic.uuid)
                        .await
                    {
                        Ok(notifications) => {
                            debug!("subscribed to {} / {}", service.uuid, characteristic.uuid);
                            cycle.subscriptions.push(HeartRateSubscription {
                                service: service.uuid,
                                characteristic: characteristic.uuid,
                                format: self.format,
                                notifications,
                            });
                        }
                        Err(err) => {
                            warn!("subscribing to {} / {} failed: {}", service.uuid, characteristic.uuid, err);
                            let err = err.context(ErrorKind::NotificationFailed, "");
                            cycle.results.push(ReadResult {
                                service: service.uuid,
                                characteristic: characteristic.uuid,
                                outcome: ReadOutcome::Failed(err.to_string()),
                            });
                        }
                    }
                } else {
                    trace!("skipping {} / {}", service.uuid, characteristic.uuid);
                }
            }
        }

        Ok(cycle)
    }

    /// Reads manufacturer, model and serial number from the Device Information service.
    ///
    /// Never fails: each field that cannot be read is set to [`READ_FAILED`].
    pub async fn read_device_info(&self, id: &PeripheralId) -> DeviceInfo {
        let info = DeviceInfo {
            manufacturer: self.read_text(id, characteristics::MANUFACTURER_NAME_STRING).await,
            model: self.read_text(id, characteristics::MODEL_NUMBER_STRING).await,
            serial: self.read_text(id, characteristics::SERIAL_NUMBER_STRING).await,
        };
        info!(
            "device info for {}: manufacturer={:?} model={:?} serial={:?}",
            id, info.manufacturer, info.model, info.serial
        );
        info
    }

    async fn read_text(&self, id: &PeripheralId, characteristic: Uuid) -> String {
        match self
            .adapter
            .read_characteristic(id, services::DEVICE_INFORMATION, characteristic)
            .await
        {
            Ok(value) => String::from_utf8_lossy(&value).into_owned(),
            Err(err) => {
                debug!("device info read of {} failed: {}", characteristic, err);
                READ_FAILED.to_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_display() {
        assert_eq!(ReadOutcome::Value(Value::Bytes(b"Acme".to_vec())).to_string(), "Acme");
        assert_eq!(ReadOutcome::Value(Value::Bytes(vec![0x01, 0xff])).to_string(), "01 ff");
        assert_eq!(
            ReadOutcome::Value(Value::HeartRate(HeartRateSample { beats_per_minute: 61 })).to_string(),
            "61"
        );
        assert_eq!(ReadOutcome::Empty.to_string(), "[No data]");
        assert_eq!(ReadOutcome::Failed("nope".into()).to_string(), "[Error: nope]");
    }

    #[test]
    fn heart_rate_service_detection() {
        let hr = ServiceDescriptor::new(services::HEART_RATE, vec![]);
        let dis = ServiceDescriptor::new(services::DEVICE_INFORMATION, vec![]);
        assert!(hr.is_heart_rate());
        assert!(!dis.is_heart_rate());
    }
}
