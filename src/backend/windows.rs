//! Windows backend: WinUSB transfers, completed through an I/O completion port, with SetupAPI
//! enumeration.

use std::io;

use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_BAD_COMMAND, ERROR_DEVICE_NOT_CONNECTED, ERROR_FILE_NOT_FOUND,
    ERROR_GEN_FAILURE, ERROR_INVALID_PARAMETER, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED,
    ERROR_SEM_TIMEOUT, ERROR_SHARING_VIOLATION, STATUS_UNSUCCESSFUL,
};

use super::{Backend, BackendDevice};
use crate::device::DeviceInformation;
use crate::error::{Error, UsbResult};

mod device;
mod engine;
mod enumeration;

use engine::WindowsEngine;

/// Translates the Win32 error code of a completed request.
pub(crate) fn translate_win32(code: i64, operation: &str) -> Error {
    let description = io::Error::from_raw_os_error(code as i32);
    let message = format!("{operation}: {description}");

    // WinUSB reports stalls as a generic failure; some drivers pass the NTSTATUS through.
    match code as u32 {
        ERROR_GEN_FAILURE => Error::Stalled { message, code },
        status if status == STATUS_UNSUCCESSFUL as u32 => Error::Stalled { message, code },
        ERROR_OPERATION_ABORTED => Error::Aborted { message, code },
        ERROR_SEM_TIMEOUT => Error::TimedOut(operation.trim_end_matches(" failed").into()),
        _ => Error::OsError { message, code },
    }
}

/// Translates the failure of a synchronous Win32 or WinUSB call.
pub(crate) fn os_error(operation: &str, error: io::Error) -> Error {
    match error.raw_os_error().map(|code| code as u32) {
        Some(ERROR_ACCESS_DENIED) => Error::PermissionDenied,
        Some(ERROR_SHARING_VIOLATION) => Error::DeviceReserved,
        Some(ERROR_FILE_NOT_FOUND) | Some(ERROR_DEVICE_NOT_CONNECTED) | Some(ERROR_BAD_COMMAND) => {
            Error::DeviceNotFound
        }
        Some(ERROR_INVALID_PARAMETER) => {
            Error::InvalidArgument(format!("{operation} was refused by WinUSB"))
        }
        Some(ERROR_NOT_FOUND) => Error::InvalidEndpoint(format!("{operation}: no such pipe")),
        Some(code) => translate_win32(i64::from(code), operation),
        None => Error::UnspecifiedOsError,
    }
}

/// The failure of the Win32 call that just returned FALSE.
pub(crate) fn last_error(operation: &str) -> Error {
    os_error(operation, io::Error::last_os_error())
}

/// Per-OS data for the Windows backend.
#[derive(Debug)]
pub struct WindowsBackend {}

impl WindowsBackend {
    pub fn new() -> UsbResult<WindowsBackend> {
        Ok(WindowsBackend {})
    }
}

impl Backend for WindowsBackend {
    fn get_devices(&self) -> UsbResult<Vec<DeviceInformation>> {
        WindowsEngine::check_shared()?;
        enumeration::devices()
    }

    fn open(&self, information: &DeviceInformation) -> UsbResult<Box<dyn BackendDevice>> {
        let path = information.backend_path.as_deref().ok_or_else(|| {
            Error::InvalidArgument("device information has no device interface path".into())
        })?;

        let engine = WindowsEngine::shared()?;
        Ok(Box::new(device::WindowsDevice::open(engine, path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_errors_keep_their_win32_code() {
        let stall = translate_win32(i64::from(ERROR_GEN_FAILURE), "transfer IN on endpoint 1 failed");
        assert!(stall.is_stall());
        assert_eq!(stall.os_code(), Some(i64::from(ERROR_GEN_FAILURE)));

        let timeout = translate_win32(i64::from(ERROR_SEM_TIMEOUT), "transfer IN on endpoint 1 failed");
        assert_eq!(timeout, Error::TimedOut("transfer IN on endpoint 1".into()));

        let aborted = translate_win32(i64::from(ERROR_OPERATION_ABORTED), "control transfer failed");
        assert!(matches!(aborted, Error::Aborted { .. }));
    }

    #[test]
    fn synchronous_errors() {
        let denied = os_error("opening device", io::Error::from_raw_os_error(ERROR_ACCESS_DENIED as i32));
        assert_eq!(denied, Error::PermissionDenied);

        let gone = os_error("opening device", io::Error::from_raw_os_error(ERROR_FILE_NOT_FOUND as i32));
        assert_eq!(gone, Error::DeviceNotFound);
    }
}
