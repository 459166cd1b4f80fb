//! A single bounded scan with an optional auto-connect target.
//!
//! Every call to [`ScanSession::start`] opens a new scan *generation*. The timeout timer and the post-match settle
//! timer remember the generation they were started for and do nothing once it is no longer current, so a timer left
//! over from an earlier scan can never stop or connect on behalf of a newer one.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_lite::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::{
    BleAdapter, ConnectOutcome, ConnectionManager, DeviceRegistry, Peripheral, Result, ScanFilter, ScanStream,
};

/// Why a scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The auto-connect target was found
    Matched,
    /// The scan window elapsed
    Timeout,
    /// The adapter refused to start the scan
    Error,
    /// [`ScanSession::stop`] was called, directly or by starting another scan
    Requested,
}

/// Progress reported by a running scan
#[derive(Debug)]
pub enum ScanEvent {
    /// A peripheral was seen for the first time in this scan
    Discovered(Peripheral),
    /// The scan ended
    Stopped(StopReason),
    /// The auto-connect attempt on the target finished
    AutoConnect(Peripheral, Result<ConnectOutcome>),
}

type EventFn = Arc<dyn Fn(ScanEvent) + Send + Sync>;

#[derive(Default)]
struct ScanState {
    generation: u64,
    scanning: bool,
    last_stop: Option<StopReason>,
    pump: Option<JoinHandle<()>>,
    on_event: Option<EventFn>,
}

struct Shared {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    settle_delay: Duration,
    state: Mutex<ScanState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn is_scanning(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && state.scanning
    }

    /// Adds `peripheral` to the registry while `generation` is still scanning.
    ///
    /// Returns `None` once the scan is over, otherwise whether the peripheral was new. The check and the insert
    /// happen under one lock, so a superseded scan cannot write into its successor's registry.
    fn record(&self, generation: u64, peripheral: &Peripheral) -> Option<bool> {
        let state = self.lock();
        if state.generation != generation || !state.scanning {
            return None;
        }
        Some(self.registry.upsert(peripheral.clone()))
    }

    /// Moves `generation` out of the scanning state. Returns `false` if it already left it or is stale.
    fn finish(&self, generation: u64, reason: StopReason) -> bool {
        let mut state = self.lock();
        if state.generation == generation && state.scanning {
            state.scanning = false;
            state.last_stop = Some(reason);
            true
        } else {
            false
        }
    }
}

/// Handle to a scan started by [`ScanSession::start`]
#[derive(Clone)]
pub struct ScanHandle {
    generation: u64,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanHandle")
            .field("generation", &self.generation)
            .field("active", &self.is_active())
            .finish()
    }
}

impl ScanHandle {
    /// The generation this scan runs under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` while this scan is still running and has not been superseded
    pub fn is_active(&self) -> bool {
        self.shared.is_scanning(self.generation)
    }
}

/// Runs one scan at a time, feeding results into a [`DeviceRegistry`].
pub struct ScanSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ScanSession")
            .field("generation", &state.generation)
            .field("scanning", &state.scanning)
            .field("last_stop", &state.last_stop)
            .finish_non_exhaustive()
    }
}

impl ScanSession {
    /// Creates an idle scan session.
    ///
    /// `settle_delay` is the pause between stopping the scan on a target match and connecting to the target.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        connections: Arc<ConnectionManager>,
        settle_delay: Duration,
    ) -> Self {
        ScanSession {
            shared: Arc::new(Shared {
                adapter,
                registry,
                connections,
                settle_delay,
                state: Mutex::new(ScanState::default()),
            }),
        }
    }

    /// Starts a scan, superseding any scan already running.
    ///
    /// The registry is cleared first. Each newly seen peripheral is added to it and reported through `on_event`.
    /// When a peripheral advertising `target_name` shows up and no pairing is in flight, the scan stops at once and
    /// the target is connected to after the settle delay. Independently, the scan stops after `timeout`.
    ///
    /// If the adapter refuses to start scanning the session returns to idle and the error is returned; there is no
    /// retry.
    pub async fn start<F>(
        &self,
        target_name: Option<String>,
        timeout: Duration,
        filter: &ScanFilter,
        on_event: F,
    ) -> Result<ScanHandle>
    where
        F: Fn(ScanEvent) + Send + Sync + 'static,
    {
        if let Err(err) = self.stop().await {
            warn!("failed to stop previous scan: {}", err);
        }

        let on_event: EventFn = Arc::new(on_event);
        let generation = {
            let mut state = self.shared.lock();
            self.shared.registry.clear();
            state.generation += 1;
            state.scanning = true;
            state.last_stop = None;
            state.on_event = Some(on_event.clone());
            state.generation
        };
        let handle = ScanHandle {
            generation,
            shared: self.shared.clone(),
        };

        info!(
            "starting scan #{} (target: {}, timeout: {:?})",
            generation,
            target_name.as_deref().unwrap_or("none"),
            timeout
        );
        let scan = match self.shared.adapter.request_scan(filter).await {
            Ok(scan) => scan,
            Err(err) => {
                warn!("scan #{} failed to start: {}", generation, err);
                if self.shared.finish(generation, StopReason::Error) {
                    on_event(ScanEvent::Stopped(StopReason::Error));
                }
                return Err(err.context(ErrorKind::ScanFailed, "failed to start scan"));
            }
        };

        let superseded = {
            let mut state = self.shared.lock();
            if state.generation == generation {
                let task = pump(self.shared.clone(), generation, scan, target_name, on_event.clone());
                state.pump = Some(tokio::spawn(task));
                None
            } else {
                Some((scan, state.scanning))
            }
        };
        if let Some((scan, newer_running)) = superseded {
            // The stop ran before the adapter scan existed, so it is turned off here
            drop(scan);
            debug!("scan #{} was stopped while starting", generation);
            if !newer_running {
                if let Err(err) = self.shared.adapter.stop_scan().await {
                    warn!("failed to stop superseded scan #{}: {}", generation, err);
                }
            }
            return Ok(handle);
        }

        tokio::spawn(expire(self.shared.clone(), generation, timeout, on_event));
        Ok(handle)
    }

    /// Stops the current scan.
    ///
    /// Calling this with no scan running is not an error. A pending auto-connect of the stopped scan is cancelled.
    pub async fn stop(&self) -> Result<()> {
        self.halt(false).await
    }

    /// Like [`stop`][ScanSession::stop], but asks the adapter to stop scanning even when no scan is known to run.
    pub async fn force_stop(&self) -> Result<()> {
        self.halt(true).await
    }

    async fn halt(&self, always: bool) -> Result<()> {
        let (was_scanning, on_event) = {
            let mut state = self.shared.lock();
            state.generation += 1;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            let was_scanning = std::mem::replace(&mut state.scanning, false);
            if was_scanning {
                state.last_stop = Some(StopReason::Requested);
            }
            (was_scanning, state.on_event.take())
        };

        if was_scanning {
            info!("stopping scan");
            if let Some(on_event) = on_event {
                on_event(ScanEvent::Stopped(StopReason::Requested));
            }
        } else if !always {
            return Ok(());
        }
        self.shared
            .adapter
            .stop_scan()
            .await
            .map_err(|err| err.context(ErrorKind::ScanFailed, "failed to stop scan"))
    }

    /// `true` while a scan is running
    pub fn is_scanning(&self) -> bool {
        self.shared.lock().scanning
    }

    /// Why the most recent scan ended, or `None` if it is still running or none ran yet
    pub fn last_stop(&self) -> Option<StopReason> {
        self.shared.lock().last_stop
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.generation += 1;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }
}

async fn pump(shared: Arc<Shared>, generation: u64, mut scan: ScanStream, target: Option<String>, on_event: EventFn) {
    while let Some(peripheral) = scan.next().await {
        let Some(added) = shared.record(generation, &peripheral) else {
            break;
        };
        if added {
            debug!("discovered {}", peripheral);
            on_event(ScanEvent::Discovered(peripheral.clone()));
        }

        if target.is_none() || peripheral.name != target {
            continue;
        }
        if shared.connections.is_pairing() || shared.connections.is_connected(&peripheral.id) {
            debug!("target {} seen while a connection is pending or established", peripheral);
            continue;
        }
        if shared.finish(generation, StopReason::Matched) {
            info!("found target {}, stopping scan", peripheral);
            tokio::spawn(auto_connect(shared.clone(), generation, peripheral, on_event.clone()));
        }
        break;
    }
}

async fn auto_connect(shared: Arc<Shared>, generation: u64, peripheral: Peripheral, on_event: EventFn) {
    if let Err(err) = shared.adapter.stop_scan().await {
        warn!("failed to stop scan after target match: {}", err);
    }
    on_event(ScanEvent::Stopped(StopReason::Matched));

    tokio::time::sleep(shared.settle_delay).await;
    if !shared.is_current(generation) {
        debug!("auto-connect to {} cancelled by a newer scan", peripheral);
        return;
    }

    let result = shared.connections.connect(&peripheral).await;
    on_event(ScanEvent::AutoConnect(peripheral, result));
}

async fn expire(shared: Arc<Shared>, generation: u64, timeout: Duration, on_event: EventFn) {
    tokio::time::sleep(timeout).await;
    if !shared.finish(generation, StopReason::Timeout) {
        return;
    }

    info!("scan #{} timed out after {:?}", generation, timeout);
    if let Err(err) = shared.adapter.stop_scan().await {
        warn!("failed to stop scan after timeout: {}", err);
    }
    on_event(ScanEvent::Stopped(StopReason::Timeout));
}
