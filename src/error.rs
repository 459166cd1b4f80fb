//! Blescan errors

/// The error type for scan, connection and GATT operations
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    message: String,
}

impl Error {
    /// Creates an error of `kind` with an optional underlying cause and a message.
    ///
    /// [`BleAdapter`][crate::BleAdapter] implementations use this to wrap their platform errors.
    pub fn new(
        kind: ErrorKind,
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
        message: impl Into<String>,
    ) -> Self {
        Error {
            kind,
            source,
            message: message.into(),
        }
    }

    /// Returns the corresponding [ErrorKind] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-tags this error with another kind, keeping the original error as its source.
    pub(crate) fn context(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::new(kind, Some(Box::new(self)), message)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.message.is_empty(), &self.source) {
            (true, None) => write!(f, "{}", &self.kind),
            (false, None) => write!(f, "{}: {}", &self.kind, &self.message),
            (true, Some(err)) => write!(f, "{}: {}", &self.kind, err),
            (false, Some(err)) => write!(f, "{}: {} ({})", &self.kind, &self.message, err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|x| {
            let x: &(dyn std::error::Error + 'static) = &**x;
            x
        })
    }
}

/// A list of general categories of session error.
#[non_exhaustive]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// the Bluetooth adapter could not be initialized
    AdapterInit,
    /// scan failed
    ScanFailed,
    /// connection failed
    ConnectFailed,
    /// disconnection failed
    DisconnectFailed,
    /// no peripheral is connected
    NotConnected,
    /// service enumeration failed
    ServiceEnumeration,
    /// characteristic read failed
    CharacteristicRead,
    /// notification subscription failed
    NotificationFailed,
    /// notification payload could not be decoded
    Decode,
    /// not found
    NotFound,
    /// error
    Other,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            source: None,
            message: String::new(),
        }
    }
}

impl From<crate::heart_rate::DecodeError> for Error {
    fn from(err: crate::heart_rate::DecodeError) -> Self {
        Error::new(ErrorKind::Decode, Some(Box::new(err)), String::new())
    }
}
