//! Every error that can occur in usbdirect.

use std::io;

/// Alias to simplify implementing the results of usbdirect functions.
pub type UsbResult<T> = Result<T, Error>;

/// Translates a raw, platform-specific transfer result code into an [Error].
///
/// The second argument describes the failed operation, e.g. "transfer IN on endpoint 1".
pub type ResultTranslator = fn(code: i64, operation: &str) -> Error;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Error for when no devices are found that match a given selector.
    #[error("no device found")]
    DeviceNotFound,

    /// The device has been closed, or was never opened.
    #[error("device needs to be opened first for this operation")]
    DeviceNotOpen,

    /// Another driver or process holds the device or interface.
    #[error("device or interface is in exclusive use by another driver or process")]
    DeviceReserved,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The endpoint doesn't exist, or isn't usable for the requested transfer.
    #[error("{0}")]
    InvalidEndpoint(String),

    /// The operation doesn't make sense in the current state; e.g. claiming an interface twice.
    #[error("{0}")]
    InvalidState(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The endpoint responded with a USB STALL; clear the halt condition to continue.
    #[error("{message}")]
    Stalled { message: String, code: i64 },

    /// The transfer was aborted after its timeout expired; the abort has completed.
    #[error("{0} aborted due to timeout")]
    TimedOut(String),

    /// The transfer was cancelled before it could complete.
    #[error("{message}")]
    Aborted { message: String, code: i64 },

    /// The device sent more data than the transfer could hold.
    #[error("{message}")]
    Overrun { message: String, code: i64 },

    /// An error reported by the OS, with its textual description appended.
    #[error("{message}")]
    OsError { message: String, code: i64 },

    #[error("operating system IO error, but the OS doesn't specify which")]
    UnspecifiedOsError,

    /// The background completion engine has died; no further transfers can complete.
    #[error("USB subsystem unavailable: {0}")]
    SubsystemUnavailable(String),

    /// A stream was used after it was closed, or after it latched an error.
    #[error("{0}")]
    Closed(String),

    /// Internal consistency error; indicates a bug in usbdirect or the OS.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the raw OS result code associated with this error, if it came from the OS.
    pub fn os_code(&self) -> Option<i64> {
        match self {
            Error::Stalled { code, .. }
            | Error::Aborted { code, .. }
            | Error::Overrun { code, .. }
            | Error::OsError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true iff this error indicates an endpoint stall.
    pub fn is_stall(&self) -> bool {
        matches!(self, Error::Stalled { .. })
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        let kind = match &error {
            Error::DeviceNotFound => io::ErrorKind::NotFound,
            Error::DeviceNotOpen | Error::Closed(_) => io::ErrorKind::NotConnected,
            Error::PermissionDenied => io::ErrorKind::PermissionDenied,
            Error::InvalidArgument(_) | Error::InvalidEndpoint(_) => io::ErrorKind::InvalidInput,
            Error::InvalidDescriptor(_) => io::ErrorKind::InvalidData,
            Error::TimedOut(_) => io::ErrorKind::TimedOut,
            Error::Aborted { .. } => io::ErrorKind::Interrupted,
            Error::DeviceReserved => io::ErrorKind::AddrInUse,
            _ => io::ErrorKind::Other,
        };

        io::Error::new(kind, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_code_is_exposed_for_os_derived_errors() {
        let stall = Error::Stalled {
            message: "transfer IN on endpoint 1 failed".into(),
            code: 32,
        };
        assert_eq!(stall.os_code(), Some(32));
        assert!(stall.is_stall());

        assert_eq!(Error::TimedOut("control transfer".into()).os_code(), None);
        assert!(!Error::DeviceNotOpen.is_stall());
    }

    #[test]
    fn timeout_message_names_operation() {
        let error = Error::TimedOut("transfer OUT on endpoint 2".into());
        assert_eq!(
            error.to_string(),
            "transfer OUT on endpoint 2 aborted due to timeout"
        );
    }

    #[test]
    fn io_error_keeps_original() {
        let converted: io::Error = Error::TimedOut("control transfer".into()).into();
        assert_eq!(converted.kind(), io::ErrorKind::TimedOut);

        let inner = converted
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<Error>());
        assert_eq!(inner, Some(&Error::TimedOut("control transfer".into())));
    }
}
