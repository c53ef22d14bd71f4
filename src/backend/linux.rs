//! Linux backend: usbdevfs transfers, completed through epoll, with sysfs enumeration.

use std::io;

use super::{Backend, BackendDevice};
use crate::device::DeviceInformation;
use crate::error::{Error, UsbResult};

mod device;
mod engine;
mod enumeration;
mod usbfs;

use engine::LinuxEngine;

/// Translates the (positive) errno of a completed URB.
pub(crate) fn translate_errno(code: i64, operation: &str) -> Error {
    let description = io::Error::from_raw_os_error(code as i32);
    let message = format!("{operation}: {description}");

    match code as i32 {
        libc::EPIPE => Error::Stalled { message, code },
        libc::ENOENT | libc::ECONNRESET => Error::Aborted { message, code },
        libc::EOVERFLOW => Error::Overrun { message, code },
        _ => Error::OsError { message, code },
    }
}

/// Translates the failure of a synchronous usbfs call.
pub(crate) fn os_error(operation: &str, error: io::Error) -> Error {
    match error.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => Error::PermissionDenied,
        Some(libc::EBUSY) => Error::DeviceReserved,
        Some(code) => translate_errno(i64::from(code), operation),
        None => Error::UnspecifiedOsError,
    }
}

/// Per-OS data for the Linux backend.
#[derive(Debug)]
pub struct LinuxBackend {}

impl LinuxBackend {
    pub fn new() -> UsbResult<LinuxBackend> {
        Ok(LinuxBackend {})
    }
}

impl Backend for LinuxBackend {
    fn get_devices(&self) -> UsbResult<Vec<DeviceInformation>> {
        LinuxEngine::check_shared()?;
        enumeration::devices()
    }

    fn open(&self, information: &DeviceInformation) -> UsbResult<Box<dyn BackendDevice>> {
        let path = information.backend_path.as_deref().ok_or_else(|| {
            Error::InvalidArgument("device information has no usbfs path".into())
        })?;

        let active_configuration = match (information.bus_number, information.device_address) {
            (Some(bus_number), Some(device_address)) => {
                enumeration::active_configuration(bus_number, device_address)
            }
            _ => None,
        };

        let engine = LinuxEngine::shared()?;
        Ok(Box::new(device::LinuxDevice::open(
            engine,
            path,
            active_configuration,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_errors_keep_their_errno() {
        let stall = translate_errno(i64::from(libc::EPIPE), "transfer IN on endpoint 1 failed");
        assert!(stall.is_stall());
        assert_eq!(stall.os_code(), Some(i64::from(libc::EPIPE)));
        assert!(stall.to_string().starts_with("transfer IN on endpoint 1 failed: "));

        let cancelled = translate_errno(i64::from(libc::ENOENT), "control transfer failed");
        assert!(matches!(cancelled, Error::Aborted { .. }));

        let busy = os_error("claiming interface 0", io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(busy, Error::DeviceReserved);
    }
}
