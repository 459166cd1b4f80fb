//! Session configuration

use std::time::Duration;

use crate::{HeartRateFormat, ScanFilter, Uuid};

/// Default length of a scan window
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default pause between stopping a scan on a target match and connecting to the target.
///
/// Many adapters reject a connect issued in the same tick as the scan teardown.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Default number of [`SessionEvent`][crate::SessionEvent]s buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Tunables of a [`Session`][crate::Session]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Advertised name that triggers an automatic connection; `None` disables auto-connect
    pub target_name: Option<String>,
    /// How long a scan runs before it is stopped
    pub scan_timeout: Duration,
    /// Pause between a target match and the connect attempt
    pub settle_delay: Duration,
    /// If not empty, only peripherals advertising one of these services are reported
    pub scan_services: Vec<Uuid>,
    /// How heart rate notifications are decoded
    pub heart_rate_format: HeartRateFormat,
    /// Events buffered per [`Session::events`][crate::Session::events] subscriber before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            target_name: None,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            scan_services: Vec::new(),
            heart_rate_format: HeartRateFormat::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Auto-connect to the first peripheral advertising `name`
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    /// Sets the scan window
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Sets the pause between a target match and the connect attempt
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Only report peripherals advertising one of `services`
    pub fn with_scan_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.scan_services = services.into_iter().collect();
        self
    }

    /// Sets how heart rate notifications are decoded
    pub fn with_heart_rate_format(mut self, format: HeartRateFormat) -> Self {
        self.heart_rate_format = format;
        self
    }

    /// Sets the per-subscriber event buffer. Values below 1 are raised to 1.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// The scan filter derived from [`scan_services`][Self::scan_services]
    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            services: self.scan_services.clone(),
        }
    }
}
