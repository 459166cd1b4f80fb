use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_lite::future::Boxed;
use futures_lite::FutureExt;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::{BleAdapter, Peripheral, PeripheralId, Result};

/// A snapshot of the connection bookkeeping.
///
/// `pairing` is `None` when no connection attempt is in flight. A peripheral is either in `connected` or not; it is
/// never listed twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// The peripheral currently being connected to, if any
    pub pairing: Option<Peripheral>,
    /// Connected peripherals, in the order they connected
    pub connected: Vec<Peripheral>,
}

impl ConnectionState {
    /// `true` when no pairing attempt is in flight
    pub fn is_idle(&self) -> bool {
        self.pairing.is_none()
    }
}

/// Result of [`ConnectionManager::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectOutcome {
    /// Another pairing attempt is in flight; nothing was done
    Busy,
    /// The peripheral is now connected
    Connected,
    /// The peripheral was already connected and has been disconnected
    Disconnected,
}

type ConnectedHook = Box<dyn Fn(Peripheral) -> Boxed<()> + Send + Sync>;

/// Holds the pairing slot; releases it when dropped, including when `connect` is cancelled mid-flight
struct PairingSlot<'a>(&'a ConnectionManager);

impl Drop for PairingSlot<'_> {
    fn drop(&mut self) {
        self.0.lock().pairing = None;
    }
}

/// Serializes connect and disconnect operations and tracks which peripherals are connected.
///
/// At most one pairing attempt is outstanding at any time. A `connect` issued while another one is in flight returns
/// [`ConnectOutcome::Busy`] without touching the adapter.
pub struct ConnectionManager {
    adapter: Arc<dyn BleAdapter>,
    state: Mutex<ConnectionState>,
    on_connected: Option<ConnectedHook>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager with nothing connected
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        ConnectionManager {
            adapter,
            state: Mutex::new(ConnectionState::default()),
            on_connected: None,
        }
    }

    /// Runs `hook` after each successful connect, before the pairing slot is released.
    ///
    /// Another `connect` issued while the hook runs is still [`ConnectOutcome::Busy`].
    pub fn on_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Peripheral) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connected = Some(Box::new(move |peripheral| hook(peripheral).boxed()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connects to `peripheral`, or disconnects it if it is already connected.
    ///
    /// Connection failures are returned as [`ErrorKind::ConnectFailed`] errors whose message names the peripheral
    /// and is suitable for showing to the user. The peripheral is not added to the connected set in that case.
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<ConnectOutcome> {
        let already_connected = {
            let mut state = self.lock();
            if let Some(pairing) = &state.pairing {
                debug!("ignoring connect to {}: already pairing with {}", peripheral, pairing);
                return Ok(ConnectOutcome::Busy);
            }

            let already_connected = state.connected.iter().any(|p| p.id == peripheral.id);
            if !already_connected {
                state.pairing = Some(peripheral.clone());
            }
            already_connected
        };

        if already_connected {
            self.disconnect(&peripheral.id).await?;
            return Ok(ConnectOutcome::Disconnected);
        }

        info!("pairing with {}", peripheral);
        let _slot = PairingSlot(self);
        if let Err(err) = self.adapter.connect(&peripheral.id).await {
            warn!("connection to {} failed: {}", peripheral, err);
            return Err(err.context(
                ErrorKind::ConnectFailed,
                format!(
                    "Connection Unsuccessful. Make sure the \"{}\" is turned on and in range.",
                    peripheral.display_name()
                ),
            ));
        }

        {
            let mut state = self.lock();
            if !state.connected.iter().any(|p| p.id == peripheral.id) {
                state.connected.push(peripheral.clone());
            }
        }
        info!("connected to {}", peripheral);
        if let Some(on_connected) = &self.on_connected {
            on_connected(peripheral.clone()).await;
        }
        Ok(ConnectOutcome::Connected)
    }

    /// Disconnects the peripheral and removes it from the connected set.
    ///
    /// On failure the connected set is left unchanged; the peripheral may well still be connected.
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        match self.adapter.disconnect(id).await {
            Ok(()) => {
                self.lock().connected.retain(|p| &p.id != id);
                info!("disconnected from {}", id);
                Ok(())
            }
            Err(err) => {
                warn!("disconnection from {} failed: {}", id, err);
                Err(err.context(ErrorKind::DisconnectFailed, format!("failed to disconnect from {}", id)))
            }
        }
    }

    /// Drops `id` from the connected set without talking to the adapter.
    ///
    /// Used when the stack reports that the link went away on its own. Returns `true` if the peripheral was
    /// connected.
    pub fn forget(&self, id: &PeripheralId) -> bool {
        let mut state = self.lock();
        let before = state.connected.len();
        state.connected.retain(|p| &p.id != id);
        before != state.connected.len()
    }

    /// A snapshot of the connection state
    pub fn state(&self) -> ConnectionState {
        self.lock().clone()
    }

    /// The peripheral currently being connected to, if any
    pub fn pairing(&self) -> Option<Peripheral> {
        self.lock().pairing.clone()
    }

    /// `true` while a pairing attempt is in flight
    pub fn is_pairing(&self) -> bool {
        self.lock().pairing.is_some()
    }

    /// Connected peripherals, in the order they connected
    pub fn connected(&self) -> Vec<Peripheral> {
        self.lock().connected.clone()
    }

    /// `true` if the peripheral is in the connected set
    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.lock().connected.iter().any(|p| &p.id == id)
    }

    /// The earliest connected peripheral; the one GATT reads are issued against
    pub fn first_connected(&self) -> Option<Peripheral> {
        self.lock().connected.first().cloned()
    }
}
