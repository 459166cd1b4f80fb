//! The session coordinator tying scanning, connecting and reading together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use futures_lite::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::{
    BleAdapter, ConnectOutcome, ConnectionEvent, ConnectionManager, ConnectionState, DeviceInfo, DeviceRegistry, Error,
    GattReader, HeartRateSubscription, Peripheral, PeripheralId, ReadResult, Result, ScanEvent, ScanHandle, ScanSession,
    SessionConfig, StopReason,
};

/// Changes to the session state, for whatever presents it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A scan started; the device list was cleared
    ScanStarted,
    /// A peripheral was seen for the first time in the current scan
    DeviceDiscovered(Peripheral),
    /// The scan ended
    ScanStopped(StopReason),
    /// A peripheral was connected
    Connected(Peripheral),
    /// A peripheral was disconnected, on request or by the link going away
    Disconnected(PeripheralId),
    /// A connection attempt failed
    ConnectFailed {
        /// The peripheral that could not be connected
        peripheral: Peripheral,
        /// Message suitable for the user
        message: String,
    },
    /// Device Information was read from a freshly connected peripheral
    DeviceInfo {
        /// The peripheral the information belongs to
        peripheral: PeripheralId,
        /// Manufacturer, model and serial number
        info: DeviceInfo,
    },
    /// A full read of the given peripheral started; the previous results were cleared
    ReadStarted(PeripheralId),
    /// A characteristic was read or a heart rate notification arrived
    ReadResult(ReadResult),
    /// The full read finished; heart rate results may keep arriving
    ReadFinished {
        /// Number of results produced by reads
        results: usize,
    },
    /// Message for the user
    Notice(String),
}

#[derive(Default)]
struct SessionState {
    reading: bool,
    read_cycle: u64,
    results: Vec<ReadResult>,
    device_info: HashMap<PeripheralId, DeviceInfo>,
    notifications: Vec<JoinHandle<()>>,
    watchers: HashMap<PeripheralId, JoinHandle<()>>,
}

impl SessionState {
    fn cancel_notifications(&mut self) {
        for task in self.notifications.drain(..) {
            task.abort();
        }
    }
}

struct Inner {
    adapter: Arc<dyn BleAdapter>,
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    scan: ScanSession,
    reader: GattReader,
    events: Sender<SessionEvent>,
    events_rx: InactiveReceiver<SessionEvent>,
    state: Mutex<SessionState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.cancel_notifications();
        for (_, watcher) in state.watchers.drain() {
            watcher.abort();
        }
    }
}

/// Clears the reading flag when dropped, so a cancelled read does not leave it set
struct ReadingFlag<'a>(&'a Inner);

impl Drop for ReadingFlag<'_> {
    fn drop(&mut self) {
        self.0.lock().reading = false;
    }
}

/// Coordinates scanning, connecting and reading for one BLE adapter.
///
/// All state is owned here and exposed through getters and the [`events`][Session::events] stream. Cloning a
/// `Session` yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.inner.config)
            .field("scan", &self.inner.scan)
            .field("connections", &self.inner.connections)
            .field("reading", &self.is_reading())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates an idle session. No adapter call is made.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: SessionConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let hook = weak.clone();
            let connections = ConnectionManager::new(adapter.clone()).on_connected(move |peripheral| {
                let inner = hook.upgrade();
                async move {
                    if let Some(inner) = inner {
                        inner.on_connected(peripheral).await;
                    }
                }
            });
            let connections = Arc::new(connections);
            let registry = Arc::new(DeviceRegistry::new());
            let scan = ScanSession::new(adapter.clone(), registry.clone(), connections.clone(), config.settle_delay);
            let reader = GattReader::new(adapter.clone(), config.heart_rate_format);

            let (mut events, events_rx) = async_broadcast::broadcast(config.event_capacity.max(1));
            events.set_overflow(true);

            Inner {
                adapter,
                config,
                registry,
                connections,
                scan,
                reader,
                events,
                events_rx: events_rx.deactivate(),
                state: Mutex::new(SessionState::default()),
            }
        });
        Session { inner }
    }

    /// Creates a session, initializes the adapter and starts the first scan.
    ///
    /// Only an adapter initialization failure is returned. A failure to start the scan is logged and reported as
    /// [`SessionEvent::ScanStopped`]; call [`scan`][Session::scan] to try again.
    pub async fn start(adapter: Arc<dyn BleAdapter>, config: SessionConfig) -> Result<Self> {
        let session = Session::new(adapter, config);
        session.initialize().await?;
        if let Err(err) = session.scan().await {
            warn!("initial scan failed: {}", err);
        }
        Ok(session)
    }

    /// Initializes the underlying adapter
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .adapter
            .initialize()
            .await
            .map_err(|err| err.context(ErrorKind::AdapterInit, "failed to initialize Bluetooth"))?;
        info!("Bluetooth initialized");
        Ok(())
    }

    /// Starts a scan using the configured target, timeout and filter.
    ///
    /// Clears the device list and the last read results and supersedes any scan already running. Connected
    /// peripherals stay connected.
    pub async fn scan(&self) -> Result<ScanHandle> {
        let inner = &self.inner;
        if let Err(err) = inner.scan.stop().await {
            warn!("failed to stop previous scan: {}", err);
        }
        {
            let mut state = inner.lock();
            state.cancel_notifications();
            state.read_cycle += 1;
            state.results.clear();
        }
        inner.publish(SessionEvent::ScanStarted);

        let weak = Arc::downgrade(inner);
        inner
            .scan
            .start(
                inner.config.target_name.clone(),
                inner.config.scan_timeout,
                &inner.config.scan_filter(),
                move |event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_scan_event(event);
                    }
                },
            )
            .await
    }

    /// Stops the current scan, if any
    pub async fn stop_scan(&self) -> Result<()> {
        self.inner.scan.stop().await
    }

    /// Connects to `peripheral`, or disconnects it if it is already connected.
    ///
    /// Returns [`ConnectOutcome::Busy`] without doing anything while another connection attempt is in flight. After
    /// connecting, the Device Information service is read and published before this returns. The attempt counts as
    /// in flight until then.
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<ConnectOutcome> {
        let result = self.inner.connections.connect(peripheral).await;
        self.inner.after_connect(peripheral, result).await
    }

    /// Disconnects a peripheral without going through the connect toggle
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        self.inner.connections.disconnect(id).await?;
        self.inner.unwatch(id);
        self.inner.publish(SessionEvent::Disconnected(id.clone()));
        Ok(())
    }

    /// Reads every characteristic of the first connected peripheral.
    ///
    /// Replaces the previous result batch. Heart rate notifications subscribed to during the pass keep appending to
    /// the batch (see [`last_results`][Session::last_results]) until the next read or scan.
    pub async fn request_read(&self) -> Result<Vec<ReadResult>> {
        let inner = &self.inner;
        let peripheral = match inner.connections.first_connected() {
            Some(peripheral) => peripheral,
            None => {
                let message = "No devices connected. Please connect to a device first.";
                inner.publish(SessionEvent::Notice(message.to_owned()));
                return Err(Error::new(ErrorKind::NotConnected, None, message));
            }
        };

        let cycle_id = {
            let mut state = inner.lock();
            state.cancel_notifications();
            state.read_cycle += 1;
            state.results.clear();
            state.reading = true;
            state.read_cycle
        };
        let reading = ReadingFlag(inner);
        inner.publish(SessionEvent::ReadStarted(peripheral.id.clone()));
        info!("reading all characteristics of {}", peripheral);

        let cycle = match inner.reader.read_all(&peripheral.id).await {
            Ok(cycle) => cycle,
            Err(err) => {
                warn!("read of {} aborted: {}", peripheral, err);
                inner.publish(SessionEvent::Notice(err.to_string()));
                return Err(err);
            }
        };
        if cycle.services == 0 {
            let message = "No services found on the connected device.";
            inner.publish(SessionEvent::Notice(message.to_owned()));
            return Err(Error::new(ErrorKind::NotFound, None, message));
        }

        let results = cycle.results;
        for result in &results {
            inner.publish(SessionEvent::ReadResult(result.clone()));
        }
        {
            let mut state = inner.lock();
            if state.read_cycle == cycle_id {
                state.results = results.clone();
                for subscription in cycle.subscriptions {
                    state.notifications.push(inner.drain(cycle_id, subscription));
                }
            }
        }
        drop(reading);

        info!("read {} characteristics of {}", results.len(), peripheral);
        inner.publish(SessionEvent::ReadFinished { results: results.len() });
        Ok(results)
    }

    /// Stops any scan and cancels notification subscriptions and connection monitoring.
    ///
    /// The adapter is told to stop scanning even if no scan is known to run. Errors are logged, never returned.
    /// Connected peripherals are left connected.
    pub async fn shutdown(&self) {
        if let Err(err) = self.inner.scan.force_stop().await {
            warn!("stop scan error: {}", err);
        }
        let mut state = self.inner.lock();
        state.cancel_notifications();
        for (_, watcher) in state.watchers.drain() {
            watcher.abort();
        }
    }

    /// A stream of [`SessionEvent`]s from now on.
    ///
    /// Slow subscribers lose the oldest events once [`SessionConfig::event_capacity`] are buffered.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.inner.events_rx.activate_cloned()
    }

    /// Peripherals discovered by the current scan, in order of discovery
    pub fn devices(&self) -> Vec<Peripheral> {
        self.inner.registry.list()
    }

    /// Connected peripherals, in the order they connected
    pub fn connected(&self) -> Vec<Peripheral> {
        self.inner.connections.connected()
    }

    /// The peripheral currently being connected to, if any
    pub fn pairing(&self) -> Option<Peripheral> {
        self.inner.connections.pairing()
    }

    /// Pairing target and connected set together
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connections.state()
    }

    /// The current read result batch
    pub fn last_results(&self) -> Vec<ReadResult> {
        self.inner.lock().results.clone()
    }

    /// Device Information read when `id` connected
    pub fn device_info(&self, id: &PeripheralId) -> Option<DeviceInfo> {
        self.inner.lock().device_info.get(id).cloned()
    }

    /// `true` while a scan is running
    pub fn is_scanning(&self) -> bool {
        self.inner.scan.is_scanning()
    }

    /// `true` while [`request_read`][Session::request_read] is walking the peripheral
    pub fn is_reading(&self) -> bool {
        self.inner.lock().reading
    }

    /// The configuration this session was created with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: SessionEvent) {
        // Err only means nobody is listening
        let _ = self.events.try_broadcast(event);
    }

    fn on_scan_event(self: &Arc<Self>, event: ScanEvent) {
        match event {
            ScanEvent::Discovered(peripheral) => self.publish(SessionEvent::DeviceDiscovered(peripheral)),
            ScanEvent::Stopped(reason) => {
                debug!("scan stopped: {:?}", reason);
                self.publish(SessionEvent::ScanStopped(reason));
            }
            ScanEvent::AutoConnect(peripheral, result) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = inner.after_connect(&peripheral, result).await {
                        warn!("auto-connect to {} failed: {}", peripheral, err);
                    }
                });
            }
        }
    }

    async fn after_connect(
        self: &Arc<Self>,
        peripheral: &Peripheral,
        result: Result<ConnectOutcome>,
    ) -> Result<ConnectOutcome> {
        match result {
            Ok(ConnectOutcome::Disconnected) => {
                self.unwatch(&peripheral.id);
                self.publish(SessionEvent::Disconnected(peripheral.id.clone()));
                self.publish(SessionEvent::Notice(format!(
                    "Disconnected from device: {}",
                    peripheral.display_name()
                )));
                Ok(ConnectOutcome::Disconnected)
            }
            // connected peripherals were announced by `on_connected`
            Ok(outcome @ (ConnectOutcome::Connected | ConnectOutcome::Busy)) => Ok(outcome),
            Err(err) if err.kind() == ErrorKind::ConnectFailed => {
                self.publish(SessionEvent::ConnectFailed {
                    peripheral: peripheral.clone(),
                    message: err.message().to_owned(),
                });
                Err(err)
            }
            // disconnect failures are only logged by the connection manager
            Err(err) => Err(err),
        }
    }

    /// Runs while the pairing slot is still held
    async fn on_connected(self: Arc<Self>, peripheral: Peripheral) {
        self.watch(peripheral.id.clone());
        self.publish(SessionEvent::Connected(peripheral.clone()));

        let info = self.reader.read_device_info(&peripheral.id).await;
        self.lock().device_info.insert(peripheral.id.clone(), info.clone());
        self.publish(SessionEvent::DeviceInfo {
            peripheral: peripheral.id,
            info,
        });
    }

    /// Forgets `id` when the adapter reports that its link went away
    fn watch(self: &Arc<Self>, id: PeripheralId) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let adapter = self.adapter.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let mut events = match adapter.connection_events(&task_id).await {
                Ok(events) => events,
                Err(err) => {
                    debug!("cannot monitor connection of {}: {}", task_id, err);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if event != ConnectionEvent::Disconnected {
                    continue;
                }
                let Some(inner) = weak.upgrade() else { break };
                if inner.connections.forget(&task_id) {
                    info!("{} disconnected", task_id);
                    inner.publish(SessionEvent::Disconnected(task_id.clone()));
                }
                break;
            }
        });

        if let Some(previous) = self.lock().watchers.insert(id, task) {
            previous.abort();
        }
    }

    fn unwatch(&self, id: &PeripheralId) {
        if let Some(watcher) = self.lock().watchers.remove(id) {
            watcher.abort();
        }
    }

    /// Appends heart rate results to the batch of `cycle_id` while it is current
    fn drain(self: &Arc<Self>, cycle_id: u64, mut subscription: HeartRateSubscription) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(result) = subscription.next().await {
                let Some(inner) = weak.upgrade() else { break };
                {
                    let mut state = inner.lock();
                    if state.read_cycle != cycle_id {
                        break;
                    }
                    state.results.push(result.clone());
                }
                inner.publish(SessionEvent::ReadResult(result));
            }
        })
    }
}
