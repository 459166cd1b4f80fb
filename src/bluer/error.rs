use crate::error::ErrorKind;

impl From<bluer::Error> for crate::Error {
    fn from(err: bluer::Error) -> Self {
        crate::Error::new(kind_from_bluer(&err), Some(Box::new(err)), String::new())
    }
}

fn kind_from_bluer(err: &bluer::Error) -> ErrorKind {
    match err.kind {
        bluer::ErrorKind::ConnectionAttemptFailed => ErrorKind::ConnectFailed,
        bluer::ErrorKind::NotFound => ErrorKind::NotFound,
        bluer::ErrorKind::ServicesUnresolved => ErrorKind::ServiceEnumeration,
        _ => ErrorKind::Other,
    }
}

impl From<bluer::InvalidAddress> for crate::Error {
    fn from(err: bluer::InvalidAddress) -> Self {
        crate::Error::new(ErrorKind::NotFound, Some(Box::new(err)), "not a Bluetooth address")
    }
}
