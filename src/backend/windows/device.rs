//! An open WinUSB device, plus the interface handles claimed on it.

use std::collections::HashMap;
use std::io;
use std::iter;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use windows_sys::Win32::Devices::Usb::{
    WinUsb_AbortPipe, WinUsb_ControlTransfer, WinUsb_Free, WinUsb_GetAssociatedInterface,
    WinUsb_GetDescriptor, WinUsb_Initialize, WinUsb_ReadPipe, WinUsb_ResetPipe,
    WinUsb_SetCurrentAlternateSetting, WinUsb_WritePipe, WINUSB_INTERFACE_HANDLE,
    WINUSB_SETUP_PACKET,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_DEVICE_NOT_CONNECTED, ERROR_IO_PENDING, ERROR_NOT_FOUND,
    FALSE, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::CancelIoEx;

use super::engine::WindowsEngine;
use super::{last_error, os_error, translate_win32};
use crate::backend::{BackendDevice, ControlTarget, EndpointInfo};
use crate::descriptor::{
    parse_configuration, TransferType, CONFIGURATION_HEADER_SIZE, DEVICE_DESCRIPTOR_SIZE,
};
use crate::error::{Error, ResultTranslator, UsbResult};
use crate::request::{DescriptorType, Direction};
use crate::transfer::{Rejected, Transfer};

/// How long closing waits for cancelled requests before giving up on them.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug)]
struct ClaimedInterface {
    handle: WINUSB_INTERFACE_HANDLE,

    /// False for the device's first interface, whose handle is the one WinUsb_Initialize returned.
    associated: bool,
}

#[derive(Debug)]
pub(crate) struct WindowsDevice {
    engine: Arc<WindowsEngine>,
    token: u64,
    file: HANDLE,

    /// Handle onto the first interface; also used for requests aimed at the device as a whole.
    winusb: WINUSB_INTERFACE_HANDLE,
    device_descriptor: Vec<u8>,
    configuration_descriptor: Vec<u8>,

    /// Interface numbers in descriptor order; WinUSB addresses associated interfaces by position.
    interface_order: Vec<u8>,
    claimed: HashMap<u8, ClaimedInterface>,
    open: bool,
}

// WinUSB and kernel handles may be used from any thread; the device itself is only used under
// its owner's lock.
unsafe impl Send for WindowsDevice {}

/// Hands a transfer back, unsubmitted, with the error that stopped it.
fn reject(error: Error, transfer: Transfer) -> Rejected {
    Rejected { error, transfer }
}

/// Checks the BOOL returned by an overlapped WinUSB call; a pending request is a success.
fn check_overlapped(succeeded: i32, operation: &str) -> UsbResult<()> {
    if succeeded != FALSE {
        return Ok(());
    }

    match unsafe { GetLastError() } {
        ERROR_IO_PENDING => Ok(()),
        code => Err(os_error(operation, io::Error::from_raw_os_error(code as i32))),
    }
}

/// Checks the BOOL returned by a synchronous call.
fn check(succeeded: i32, operation: &str) -> UsbResult<()> {
    match succeeded {
        FALSE => Err(last_error(operation)),
        _ => Ok(()),
    }
}

fn read_descriptor(
    winusb: WINUSB_INTERFACE_HANDLE,
    descriptor_type: DescriptorType,
    length: usize,
) -> UsbResult<Vec<u8>> {
    let mut descriptor = vec![0u8; length];
    let mut transferred: u32 = 0;

    let succeeded = unsafe {
        WinUsb_GetDescriptor(
            winusb,
            descriptor_type as u8,
            0,
            0,
            descriptor.as_mut_ptr(),
            length as u32,
            &mut transferred,
        )
    };
    check(succeeded, "reading descriptor")?;

    descriptor.truncate(transferred as usize);
    Ok(descriptor)
}

/// Reads the configuration descriptor WinUSB selected, header first to learn its length.
fn read_configuration(winusb: WINUSB_INTERFACE_HANDLE) -> UsbResult<Vec<u8>> {
    let header = read_descriptor(winusb, DescriptorType::Configuration, CONFIGURATION_HEADER_SIZE)?;
    if header.len() < CONFIGURATION_HEADER_SIZE {
        return Err(Error::InvalidDescriptor(format!(
            "configuration descriptor header is only {} bytes",
            header.len()
        )));
    }

    let total = u16::from_le_bytes([header[2], header[3]]) as usize;
    read_descriptor(winusb, DescriptorType::Configuration, total)
}

impl WindowsDevice {
    /// Opens a device interface path for WinUSB, and associates it with the engine.
    pub(crate) fn open(engine: Arc<WindowsEngine>, path: &str) -> UsbResult<Self> {
        let wide_path: Vec<u16> = path.encode_utf16().chain(iter::once(0)).collect();

        let file = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if file == INVALID_HANDLE_VALUE {
            return Err(last_error(&format!("opening {path}")));
        }

        let mut winusb: WINUSB_INTERFACE_HANDLE = ptr::null_mut();
        if unsafe { WinUsb_Initialize(file, &mut winusb) } == FALSE {
            let error = last_error(&format!("initializing WinUSB for {path}"));
            unsafe { CloseHandle(file) };
            return Err(error);
        }

        match Self::finish_open(engine, file, winusb) {
            Ok(device) => {
                debug!("opened WinUSB device {path} as device {}", device.token);
                Ok(device)
            }
            Err(error) => {
                unsafe {
                    WinUsb_Free(winusb);
                    CloseHandle(file);
                }
                Err(error)
            }
        }
    }

    fn finish_open(
        engine: Arc<WindowsEngine>,
        file: HANDLE,
        winusb: WINUSB_INTERFACE_HANDLE,
    ) -> UsbResult<Self> {
        let device_descriptor = read_descriptor(winusb, DescriptorType::Device, DEVICE_DESCRIPTOR_SIZE)?;
        let configuration_descriptor = read_configuration(winusb)?;
        let interface_order = parse_configuration(&configuration_descriptor)?
            .interfaces
            .iter()
            .map(|interface| interface.number)
            .collect();

        let token = engine.register(file)?;

        Ok(WindowsDevice {
            engine,
            token,
            file,
            winusb,
            device_descriptor,
            configuration_descriptor,
            interface_order,
            claimed: HashMap::new(),
            open: true,
        })
    }

    fn interface_handle(&self, interface: u8) -> UsbResult<WINUSB_INTERFACE_HANDLE> {
        self.claimed
            .get(&interface)
            .map(|claimed| claimed.handle)
            .ok_or_else(|| Error::InvalidState(format!("interface {interface} is not claimed")))
    }

    /// Picks the WinUSB handle a control request has to go through.
    fn control_handle(&self, target: ControlTarget) -> UsbResult<WINUSB_INTERFACE_HANDLE> {
        match target {
            ControlTarget::Device | ControlTarget::Other => Ok(self.winusb),
            ControlTarget::Interface(interface) => self.interface_handle(interface),
            ControlTarget::Endpoint {
                interface: Some(interface),
                ..
            } => self.interface_handle(interface),
            ControlTarget::Endpoint {
                address,
                interface: None,
            } => Err(Error::InvalidEndpoint(format!(
                "endpoint {address:#04x} belongs to no claimed interface"
            ))),
        }
    }

    /// Cancels the device's pending requests; one endpoint's, or all of them.
    fn cancel(&self, endpoint_address: Option<u8>) {
        let file = self.file;

        self.engine
            .index
            .for_each_pending(self.token, endpoint_address, |id, native| {
                if unsafe { CancelIoEx(file, &native.overlapped) } == FALSE {
                    // ERROR_NOT_FOUND means the request completed in the meantime.
                    let code = unsafe { GetLastError() };
                    if code != ERROR_NOT_FOUND {
                        warn!("could not cancel transfer {id}: Win32 error {code}");
                    }
                }
            });
    }
}

impl BackendDevice for WindowsDevice {
    fn device_descriptor(&self) -> &[u8] {
        &self.device_descriptor
    }

    fn configuration_descriptor(&self) -> &[u8] {
        &self.configuration_descriptor
    }

    fn claim_interface(&mut self, interface: u8, detach_kernel_driver: bool) -> UsbResult<()> {
        if detach_kernel_driver {
            debug!("WinUSB is the device's driver; claiming interface {interface} as-is");
        }

        let position = self
            .interface_order
            .iter()
            .position(|number| *number == interface)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "interface {interface} does not exist in the active configuration"
                ))
            })?;

        let claimed = match position {
            0 => ClaimedInterface {
                handle: self.winusb,
                associated: false,
            },
            _ => {
                let mut handle: WINUSB_INTERFACE_HANDLE = ptr::null_mut();
                let succeeded = unsafe {
                    WinUsb_GetAssociatedInterface(self.winusb, (position - 1) as u8, &mut handle)
                };
                check(succeeded, &format!("claiming interface {interface}"))?;
                ClaimedInterface {
                    handle,
                    associated: true,
                }
            }
        };

        self.claimed.insert(interface, claimed);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> UsbResult<()> {
        let claimed = self.claimed.remove(&interface).ok_or_else(|| {
            Error::InvalidState(format!("interface {interface} is not claimed"))
        })?;

        if claimed.associated {
            unsafe { WinUsb_Free(claimed.handle) };
        }
        Ok(())
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> UsbResult<()> {
        let handle = self.interface_handle(interface)?;
        let succeeded = unsafe { WinUsb_SetCurrentAlternateSetting(handle, setting) };
        check(
            succeeded,
            &format!("selecting alternate setting {setting} of interface {interface}"),
        )
    }

    fn submit_control(&mut self, target: ControlTarget, transfer: Transfer) -> Result<(), Rejected> {
        let handle = match self.control_handle(target) {
            Ok(handle) => handle,
            Err(error) => return Err(reject(error, transfer)),
        };
        let setup: [u8; 8] = match transfer.setup_packet().and_then(|setup| setup.try_into().ok()) {
            Some(setup) => setup,
            None => {
                let error = Error::Internal("control transfer without setup packet".into());
                return Err(reject(error, transfer));
            }
        };

        self.engine
            .index
            .submit(self.token, 0, transfer, |id, native, transfer| {
                let (data, length) = transfer.native_data();
                let packet = WINUSB_SETUP_PACKET {
                    RequestType: setup[0],
                    Request: setup[1],
                    Value: u16::from_le_bytes([setup[2], setup[3]]),
                    Index: u16::from_le_bytes([setup[4], setup[5]]),
                    Length: length as u16,
                };

                let overlapped = native.prepare(id);
                let succeeded = unsafe {
                    WinUsb_ControlTransfer(
                        handle,
                        packet,
                        data,
                        length as u32,
                        ptr::null_mut(),
                        overlapped,
                    )
                };
                check_overlapped(succeeded, "submitting control transfer")
            })
            .map(|_| ())
    }

    fn submit(
        &mut self,
        endpoint: &EndpointInfo,
        transfer: Transfer,
        _timeout: Option<Duration>,
    ) -> Result<(), Rejected> {
        let handle = match self.interface_handle(endpoint.interface_number) {
            Ok(handle) => handle,
            Err(error) => return Err(reject(error, transfer)),
        };
        let address = endpoint.address();
        let direction = endpoint.direction;
        let operation = format!("submitting {}", endpoint.describe());

        self.engine
            .index
            .submit(self.token, address, transfer, |id, native, transfer| {
                let (data, length) = transfer.native_data();
                let length = u32::try_from(length).map_err(|_| {
                    Error::InvalidArgument(format!("transfer of {length} bytes is too long"))
                })?;

                let overlapped = native.prepare(id);
                let succeeded = unsafe {
                    match direction {
                        Direction::In => {
                            WinUsb_ReadPipe(handle, address, data, length, ptr::null_mut(), overlapped)
                        }
                        Direction::Out => {
                            WinUsb_WritePipe(handle, address, data, length, ptr::null_mut(), overlapped)
                        }
                    }
                };
                check_overlapped(succeeded, &operation)
            })
            .map(|_| ())
    }

    fn abort_transfers(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        // WinUSB has no pipe to abort for the default control endpoint.
        if endpoint.transfer_type == TransferType::Control {
            self.cancel(Some(0));
            return Ok(());
        }

        let handle = self.interface_handle(endpoint.interface_number)?;
        let succeeded = unsafe { WinUsb_AbortPipe(handle, endpoint.address()) };
        check(succeeded, &format!("aborting {}", endpoint.describe()))
    }

    fn clear_halt(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        let handle = self.interface_handle(endpoint.interface_number)?;
        let succeeded = unsafe { WinUsb_ResetPipe(handle, endpoint.address()) };
        check(
            succeeded,
            &format!("clearing halt on endpoint {:#04x}", endpoint.address()),
        )
    }

    fn result_translator(&self) -> ResultTranslator {
        translate_win32
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        self.cancel(None);
        if !self.engine.index.wait_until_drained(self.token, CLOSE_DRAIN_TIMEOUT) {
            let failed = self
                .engine
                .index
                .fail_pending(self.token, i64::from(ERROR_DEVICE_NOT_CONNECTED));
            warn!("device {} closed with {failed} requests never completed", self.token);
        }

        for (_, claimed) in self.claimed.drain() {
            if claimed.associated {
                unsafe { WinUsb_Free(claimed.handle) };
            }
        }
        unsafe {
            WinUsb_Free(self.winusb);
            CloseHandle(self.file);
        }
        debug!("closed WinUSB device {}", self.token);
    }
}

impl Drop for WindowsDevice {
    fn drop(&mut self) {
        self.close();
    }
}
