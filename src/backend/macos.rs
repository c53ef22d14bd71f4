//! macOS backend: IOKit user-client transfers, completed through a CFRunLoop.

use io_kit_sys::ret::{
    kIOReturnAborted, kIOReturnBadArgument, kIOReturnExclusiveAccess, kIOReturnNoDevice,
    kIOReturnNotOpen, kIOReturnOverrun, IOReturn,
};

use super::{Backend, BackendDevice};
use crate::device::DeviceInformation;
use crate::error::{Error, UsbResult};

mod device;
mod engine;
mod enumeration;
mod iokit;
mod iokit_c;

use engine::MacOsEngine;
use iokit_c::{
    kIOReturnNotPermitted, kIOReturnNotPrivileged, kIOUSBNoAsyncPortErr, kIOUSBPipeStalled,
    kIOUSBTransactionTimeout, kIOUSBUnknownPipeErr,
};

/// Translates the IOReturn of a completed request.
#[allow(non_upper_case_globals)]
pub(crate) fn translate_ioreturn(code: i64, operation: &str) -> Error {
    let message = format!("{operation}: IOKit error {:#010x}", code as u32);

    match code as IOReturn {
        kIOUSBPipeStalled => Error::Stalled { message, code },
        kIOReturnAborted => Error::Aborted { message, code },
        kIOReturnOverrun => Error::Overrun { message, code },
        kIOUSBTransactionTimeout => Error::TimedOut(operation.trim_end_matches(" failed").into()),
        _ => Error::OsError { message, code },
    }
}

/// Translates the IOReturn of a synchronous IOKit call.
#[allow(non_upper_case_globals)]
pub(crate) fn io_return_error(rc: IOReturn, operation: &str) -> Error {
    match rc {
        kIOReturnNotOpen | kIOUSBNoAsyncPortErr => Error::DeviceNotOpen,
        kIOReturnNoDevice => Error::DeviceNotFound,
        kIOReturnExclusiveAccess => Error::DeviceReserved,
        kIOReturnNotPermitted | kIOReturnNotPrivileged => Error::PermissionDenied,
        kIOReturnBadArgument => Error::InvalidArgument(format!("{operation} was refused by IOKit")),
        kIOUSBUnknownPipeErr => Error::InvalidEndpoint(format!("{operation}: no such pipe")),
        _ => translate_ioreturn(i64::from(rc), operation),
    }
}

/// Per-OS data for the macOS backend.
#[derive(Debug)]
pub struct MacOsBackend {}

impl MacOsBackend {
    pub fn new() -> UsbResult<MacOsBackend> {
        Ok(MacOsBackend {})
    }
}

impl Backend for MacOsBackend {
    fn get_devices(&self) -> UsbResult<Vec<DeviceInformation>> {
        MacOsEngine::check_shared()?;
        enumeration::devices()
    }

    fn open(&self, information: &DeviceInformation) -> UsbResult<Box<dyn BackendDevice>> {
        let location = information.backend_numeric_location.ok_or_else(|| {
            Error::InvalidArgument("device information has no IOKit location ID".into())
        })?;

        let engine = MacOsEngine::shared()?;
        Ok(Box::new(device::MacOsDevice::open(engine, location)?))
    }
}
