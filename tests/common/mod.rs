//! A scripted in-memory [`BleAdapter`] shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use blescan::adapter::{ConnectionEventStream, NotificationStream, ScanFilter, ScanStream};
use blescan::error::ErrorKind;
use blescan::{
    BleAdapter, ConnectionEvent, Error, NotificationPayload, Peripheral, PeripheralId, Result, ServiceDescriptor, Uuid,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Installs a `tracing` subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Adapter calls, in the order they were made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initialize,
    RequestScan(Vec<Uuid>),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    Services(PeripheralId),
    Read(Uuid, Uuid),
    StartNotifications(Uuid, Uuid),
    ConnectionEvents(PeripheralId),
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    fail_initialize: bool,
    fail_scan: bool,
    scan_delay: Duration,
    scan: Option<UnboundedSender<Peripheral>>,
    connect_delay: Duration,
    connect_failures: HashSet<PeripheralId>,
    disconnect_failures: HashSet<PeripheralId>,
    services: Option<Vec<ServiceDescriptor>>,
    services_delay: Duration,
    reads: HashMap<(Uuid, Uuid), std::result::Result<Vec<u8>, String>>,
    notify_failures: HashSet<Uuid>,
    notifications: HashMap<Uuid, UnboundedSender<NotificationPayload>>,
    links: HashMap<PeripheralId, UnboundedSender<ConnectionEvent>>,
}

#[derive(Default)]
pub struct MockAdapter {
    state: Mutex<MockState>,
}

fn failure(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Other, None, message)
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn fail_initialize(&self) {
        self.lock().fail_initialize = true;
    }

    pub fn fail_scan(&self) {
        self.lock().fail_scan = true;
    }

    /// Makes `request_scan` take `delay` before the scan is running
    pub fn set_scan_delay(&self, delay: Duration) {
        self.lock().scan_delay = delay;
    }

    /// `true` while the adapter-level scan is on
    pub fn is_scanning(&self) -> bool {
        self.lock().scan.is_some()
    }

    /// Delivers an advertisement to the running scan. Returns `false` if no scan stream is alive.
    pub fn advertise(&self, id: &str, name: Option<&str>) -> bool {
        let peripheral = Peripheral::new(id, name.map(str::to_owned));
        match &self.lock().scan {
            Some(tx) => tx.send(peripheral).is_ok(),
            None => false,
        }
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn fail_connect(&self, id: &str) {
        self.lock().connect_failures.insert(id.into());
    }

    pub fn fail_disconnect(&self, id: &str) {
        self.lock().disconnect_failures.insert(id.into());
    }

    pub fn set_services(&self, services: Vec<ServiceDescriptor>) {
        self.lock().services = Some(services);
    }

    pub fn set_services_delay(&self, delay: Duration) {
        self.lock().services_delay = delay;
    }

    pub fn set_read(&self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.lock().reads.insert((service, characteristic), Ok(value.to_vec()));
    }

    pub fn fail_read(&self, service: Uuid, characteristic: Uuid, message: &str) {
        self.lock().reads.insert((service, characteristic), Err(message.to_owned()));
    }

    pub fn fail_notifications(&self, characteristic: Uuid) {
        self.lock().notify_failures.insert(characteristic);
    }

    /// Pushes a notification to the subscriber of `characteristic`. Returns `false` if nobody is subscribed.
    pub fn notify(&self, characteristic: Uuid, payload: impl Into<NotificationPayload>) -> bool {
        match self.lock().notifications.get(&characteristic) {
            Some(tx) => tx.send(payload.into()).is_ok(),
            None => false,
        }
    }

    /// Reports an unsolicited disconnect of `id`. Returns `false` if nobody watches the link.
    pub fn drop_link(&self, id: &str) -> bool {
        match self.lock().links.get(&PeripheralId::from(id)) {
            Some(tx) => tx.send(ConnectionEvent::Disconnected).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn initialize(&self) -> Result<()> {
        self.record(Call::Initialize);
        if self.lock().fail_initialize {
            return Err(failure("bluetooth is off"));
        }
        Ok(())
    }

    async fn request_scan(&self, filter: &ScanFilter) -> Result<ScanStream> {
        self.record(Call::RequestScan(filter.services.clone()));
        let delay = self.lock().scan_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.fail_scan {
            return Err(failure("scan refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.scan = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        self.lock().scan = None;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.record(Call::Connect(id.clone()));
        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.lock().connect_failures.contains(id) {
            return Err(failure("connection timed out"));
        }
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        self.record(Call::Disconnect(id.clone()));
        if self.lock().disconnect_failures.contains(id) {
            return Err(failure("link busy"));
        }
        Ok(())
    }

    async fn services(&self, id: &PeripheralId) -> Result<Vec<ServiceDescriptor>> {
        self.record(Call::Services(id.clone()));
        let delay = self.lock().services_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.lock()
            .services
            .clone()
            .ok_or_else(|| failure("service discovery failed"))
    }

    async fn read_characteristic(&self, _id: &PeripheralId, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.record(Call::Read(service, characteristic));
        match self.lock().reads.get(&(service, characteristic)) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(failure(message.clone())),
            None => Err(Error::new(ErrorKind::NotFound, None, "no such characteristic")),
        }
    }

    async fn start_notifications(
        &self,
        _id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        self.record(Call::StartNotifications(service, characteristic));
        let mut state = self.lock();
        if state.notify_failures.contains(&characteristic) {
            return Err(failure("notify not permitted"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.notifications.insert(characteristic, tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn connection_events(&self, id: &PeripheralId) -> Result<ConnectionEventStream> {
        self.record(Call::ConnectionEvents(id.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().links.insert(id.clone(), tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
