use std::sync::{Mutex, MutexGuard};

use crate::{Peripheral, PeripheralId};

/// Peripherals discovered by the current scan, unique by id and kept in order of first sighting.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Peripheral>>,
}

impl DeviceRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Peripheral>> {
        self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `peripheral` unless its id is already present.
    ///
    /// Returns `true` if the peripheral was newly added. Re-sighting a known id keeps the first entry untouched.
    pub fn upsert(&self, peripheral: Peripheral) -> bool {
        let mut devices = self.lock();
        if devices.iter().any(|d| d.id == peripheral.id) {
            false
        } else {
            devices.push(peripheral);
            true
        }
    }

    /// Removes every entry
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// A snapshot of the registry in insertion order
    pub fn list(&self) -> Vec<Peripheral> {
        self.lock().clone()
    }

    /// Looks up a peripheral by id
    pub fn get(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.lock().iter().find(|d| &d.id == id).cloned()
    }

    /// Number of unique peripherals seen
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// `true` if nothing has been discovered yet
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
