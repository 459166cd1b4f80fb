use std::sync::Mutex;

use async_trait::async_trait;
use bluer::{AdapterEvent, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::adapter::{ConnectionEventStream, NotificationStream, ScanFilter, ScanStream};
use crate::error::ErrorKind;
use crate::{
    BleAdapter, CharacteristicDescriptor, CharacteristicProperties, ConnectionEvent, Error, NotificationPayload,
    Peripheral, PeripheralId, Result, ServiceDescriptor, Uuid,
};

/// The system's default BlueZ adapter.
///
/// Peripherals are identified by their Bluetooth address in `AA:BB:CC:DD:EE:FF` form.
#[derive(Debug, Default)]
pub struct BluerAdapter {
    inner: OnceCell<bluer::Adapter>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluerAdapter {
    /// Creates an adapter handle. Nothing talks to BlueZ until [`BleAdapter::initialize`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    fn adapter(&self) -> Result<&bluer::Adapter> {
        self.inner
            .get()
            .ok_or_else(|| Error::new(ErrorKind::AdapterInit, None, "adapter not initialized"))
    }

    fn device(&self, id: &PeripheralId) -> Result<bluer::Device> {
        let addr: bluer::Address = id.as_str().parse()?;
        Ok(self.adapter()?.device(addr)?)
    }

    async fn characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<bluer::gatt::remote::Characteristic> {
        let device = self.device(id)?;
        for s in device.services().await? {
            if s.uuid().await? != service {
                continue;
            }
            for c in s.characteristics().await? {
                if c.uuid().await? == characteristic {
                    return Ok(c);
                }
            }
        }
        Err(Error::new(
            ErrorKind::NotFound,
            None,
            format!("characteristic {} of service {} not found", characteristic, service),
        ))
    }

    fn replace_discovery(&self, task: Option<JoinHandle<()>>) {
        let mut discovery = self.discovery.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = std::mem::replace(&mut *discovery, task) {
            previous.abort();
        }
    }
}

/// Waits for a forwarding task to report whether its BlueZ stream could be opened
async fn ready(rx: oneshot::Receiver<bluer::Result<()>>) -> Result<()> {
    match rx.await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(Error::new(ErrorKind::Other, None, "forwarding task ended unexpectedly")),
    }
}

#[async_trait]
impl BleAdapter for BluerAdapter {
    async fn initialize(&self) -> Result<()> {
        let adapter = self
            .inner
            .get_or_try_init(|| async {
                let session = bluer::Session::new().await?;
                Ok::<_, Error>(session.default_adapter().await?)
            })
            .await?;
        adapter.set_powered(true).await?;
        info!("using adapter {}", adapter.name());
        Ok(())
    }

    async fn request_scan(&self, filter: &ScanFilter) -> Result<ScanStream> {
        let adapter = self.adapter()?.clone();
        adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: filter.services.iter().copied().collect(),
                transport: DiscoveryTransport::Le,
                ..Default::default()
            })
            .await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            // Discovery runs as long as `events` is alive
            let events = match adapter.discover_devices().await {
                Ok(events) => events,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(addr) = event else { continue };
                let name = match adapter.device(addr) {
                    Ok(device) => device.name().await.unwrap_or_default(),
                    Err(err) => {
                        debug!("ignoring {}: {}", addr, err);
                        continue;
                    }
                };
                if tx.send(Peripheral::new(addr.to_string(), name)).is_err() {
                    break;
                }
            }
        });
        ready(ready_rx).await?;
        self.replace_discovery(Some(task));

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.replace_discovery(None);
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.device(id)?.connect().await.map_err(Into::into)
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        self.device(id)?.disconnect().await.map_err(Into::into)
    }

    async fn services(&self, id: &PeripheralId) -> Result<Vec<ServiceDescriptor>> {
        let device = self.device(id)?;
        let mut services = Vec::new();
        for service in device.services().await? {
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                let flags = characteristic.flags().await?;
                characteristics.push(CharacteristicDescriptor::new(
                    characteristic.uuid().await?,
                    CharacteristicProperties {
                        read: flags.read,
                        notify: flags.notify || flags.indicate,
                    },
                ));
            }
            services.push(ServiceDescriptor::new(service.uuid().await?, characteristics));
        }
        Ok(services)
    }

    async fn read_characteristic(&self, id: &PeripheralId, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(id, service, characteristic).await?;
        characteristic.read().await.map_err(Into::into)
    }

    async fn start_notifications(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let characteristic = self.characteristic(id, service, characteristic).await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let notifications = match characteristic.notify().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            tokio::pin!(notifications);
            // Dropping `notifications` unsubscribes
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    value = notifications.next() => match value {
                        Some(value) => {
                            let _ = tx.send(NotificationPayload::Bytes(value));
                        }
                        None => break,
                    },
                }
            }
        });
        ready(ready_rx).await?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn connection_events(&self, id: &PeripheralId) -> Result<ConnectionEventStream> {
        let device = self.device(id)?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let events = match device.events().await {
                Ok(events) => events,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            let events = events.filter_map(|event| match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => Some(ConnectionEvent::Connected),
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => Some(ConnectionEvent::Disconnected),
                _ => None,
            });
            tokio::pin!(events);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(event) => {
                            let _ = tx.send(event);
                        }
                        None => break,
                    },
                }
            }
        });
        ready(ready_rx).await?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
