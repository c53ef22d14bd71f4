//! An open IOKit device, plus the interfaces claimed on it.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use io_kit_sys::ret::kIOReturnNoDevice;
use log::{debug, warn};

use super::engine::{transfer_completed, MacOsEngine};
use super::enumeration;
use super::iokit::{check, to_iokit_timeout, OsDevice, OsInterface, Pipe, RunLoopSource};
use super::iokit_c::IOUSBDevRequest;
use super::translate_ioreturn;
use crate::backend::{BackendDevice, ControlTarget, EndpointInfo};
use crate::descriptor::{TransferType, DEVICE_DESCRIPTOR_SIZE};
use crate::error::{Error, ResultTranslator, UsbResult};
use crate::request::{DescriptorType, Direction, StandardDeviceRequest};
use crate::transfer::{Rejected, Transfer};

/// How long closing waits for aborted requests before giving up on them.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ClaimedInterface {
    interface: OsInterface,
    source: RunLoopSource,

    /// Pipes of the current alternate setting, by endpoint address.
    pipes: HashMap<u8, Pipe>,
}

impl ClaimedInterface {
    fn refresh_pipes(&mut self) -> UsbResult<()> {
        self.pipes = self
            .interface
            .pipes()?
            .into_iter()
            .map(|pipe| (pipe.address, pipe))
            .collect();
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MacOsDevice {
    engine: Arc<MacOsEngine>,
    token: u64,
    device: OsDevice,
    source: RunLoopSource,
    device_descriptor: Vec<u8>,
    configuration_descriptor: Vec<u8>,
    interfaces: HashMap<u8, ClaimedInterface>,
    open: bool,
}

/// Hands a transfer back, unsubmitted, with the error that stopped it.
fn reject(error: Error, transfer: Transfer) -> Rejected {
    Rejected { error, transfer }
}

impl MacOsDevice {
    /// Opens the device at the given location ID, and registers it with the engine.
    pub(crate) fn open(engine: Arc<MacOsEngine>, location: u64) -> UsbResult<Self> {
        let service = enumeration::find_device(location)?;
        let mut device = OsDevice::from_service(&service)?;
        device.open()?;

        let device_descriptor = read_device_descriptor(&device)?;
        let configuration_descriptor = active_configuration(&device)?;

        let source = device.create_event_source()?;
        engine.add_source(source)?;
        let token = engine.index.register_owner();
        debug!("opened IOKit device at location {location:#010x} as device {token}");

        Ok(MacOsDevice {
            engine,
            token,
            device,
            source,
            device_descriptor,
            configuration_descriptor,
            interfaces: HashMap::new(),
            open: true,
        })
    }

    fn pipe(&self, endpoint: &EndpointInfo) -> UsbResult<(&ClaimedInterface, Pipe)> {
        let claimed = self
            .interfaces
            .get(&endpoint.interface_number)
            .ok_or_else(|| {
                Error::InvalidEndpoint(format!(
                    "interface {} is not claimed",
                    endpoint.interface_number
                ))
            })?;

        let pipe = claimed.pipes.get(&endpoint.address()).copied().ok_or_else(|| {
            Error::InvalidEndpoint(format!(
                "IOKit has no pipe for endpoint {:#04x}",
                endpoint.address()
            ))
        })?;
        Ok((claimed, pipe))
    }
}

/// Reads the device descriptor with a synchronous GET_DESCRIPTOR request.
fn read_device_descriptor(device: &OsDevice) -> UsbResult<Vec<u8>> {
    let mut descriptor = vec![0u8; DEVICE_DESCRIPTOR_SIZE];
    let mut request = IOUSBDevRequest {
        bmRequestType: 0x80,
        bRequest: StandardDeviceRequest::GetDescriptor.into(),
        wValue: (DescriptorType::Device as u16) << 8,
        wIndex: 0,
        wLength: DEVICE_DESCRIPTOR_SIZE as u16,
        pData: descriptor.as_mut_ptr().cast(),
        wLenDone: 0,
    };

    let length = device.device_request(&mut request)?;
    descriptor.truncate(length);
    Ok(descriptor)
}

/// Returns the descriptor of the active configuration. An unconfigured device is switched to
/// its first configuration.
fn active_configuration(device: &OsDevice) -> UsbResult<Vec<u8>> {
    let active = device.configuration()?;

    let mut first = None;
    for index in 0..device.configuration_count()? {
        let descriptor = device.configuration_descriptor(index)?;
        if descriptor.get(5) == Some(&active) {
            return Ok(descriptor);
        }
        first.get_or_insert(descriptor);
    }

    let first =
        first.ok_or_else(|| Error::InvalidDescriptor("device has no configuration descriptor".into()))?;
    if let Some(value) = first.get(5) {
        debug!("device is unconfigured; selecting configuration {value}");
        device.set_configuration(*value)?;
    }
    Ok(first)
}

impl BackendDevice for MacOsDevice {
    fn device_descriptor(&self) -> &[u8] {
        &self.device_descriptor
    }

    fn configuration_descriptor(&self) -> &[u8] {
        &self.configuration_descriptor
    }

    fn claim_interface(&mut self, interface: u8, detach_kernel_driver: bool) -> UsbResult<()> {
        if detach_kernel_driver {
            debug!("macOS can't detach kernel drivers from userspace; claiming interface {interface} as-is");
        }

        let iterator = self.device.interface_iterator()?;
        while let Some(service) = iterator.next_object() {
            let mut candidate = OsInterface::from_service(&service)?;
            if candidate.number()? != interface {
                continue;
            }

            candidate.open()?;
            let source = candidate.create_event_source()?;
            let mut claimed = ClaimedInterface {
                interface: candidate,
                source,
                pipes: HashMap::new(),
            };
            claimed.refresh_pipes()?;

            self.engine.add_source(source)?;
            self.interfaces.insert(interface, claimed);
            return Ok(());
        }

        Err(Error::InvalidArgument(format!(
            "interface {interface} does not exist in the active configuration"
        )))
    }

    fn release_interface(&mut self, interface: u8) -> UsbResult<()> {
        let claimed = self.interfaces.remove(&interface).ok_or_else(|| {
            Error::InvalidState(format!("interface {interface} is not claimed"))
        })?;

        self.engine.remove_source(claimed.source);
        drop(claimed);
        Ok(())
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> UsbResult<()> {
        let claimed = self.interfaces.get_mut(&interface).ok_or_else(|| {
            Error::InvalidState(format!("interface {interface} is not claimed"))
        })?;

        claimed.interface.set_alternate_setting(setting)?;
        claimed.refresh_pipes()
    }

    fn submit_control(&mut self, _target: ControlTarget, transfer: Transfer) -> Result<(), Rejected> {
        let setup: [u8; 8] = match transfer.setup_packet().and_then(|setup| setup.try_into().ok()) {
            Some(setup) => setup,
            None => {
                let error = Error::Internal("control transfer without setup packet".into());
                return Err(reject(error, transfer));
            }
        };
        let device = &self.device;

        self.engine
            .index
            .submit(self.token, 0, transfer, |id, native, transfer| {
                let (data, length) = transfer.native_data();
                native.request = IOUSBDevRequest {
                    bmRequestType: setup[0],
                    bRequest: setup[1],
                    wValue: u16::from_le_bytes([setup[2], setup[3]]),
                    wIndex: u16::from_le_bytes([setup[4], setup[5]]),
                    wLength: length as u16,
                    pData: data.cast(),
                    wLenDone: 0,
                };

                let rc = device.device_request_async(
                    &mut native.request,
                    transfer_completed,
                    id as usize as *mut c_void,
                );
                check(rc, "submitting control transfer")
            })
            .map(|_| ())
    }

    fn submit(
        &mut self,
        endpoint: &EndpointInfo,
        transfer: Transfer,
        timeout: Option<Duration>,
    ) -> Result<(), Rejected> {
        let (claimed, pipe) = match self.pipe(endpoint) {
            Ok(found) => found,
            Err(error) => return Err(reject(error, transfer)),
        };
        let timeout_ms = timeout.map(to_iokit_timeout);
        let direction = endpoint.direction;
        let operation = format!("submitting {}", endpoint.describe());

        self.engine
            .index
            .submit(self.token, endpoint.address(), transfer, |id, _, transfer| {
                let (data, length) = transfer.native_data();
                let length = u32::try_from(length).map_err(|_| {
                    Error::InvalidArgument(format!("transfer of {length} bytes is too long"))
                })?;
                let refcon = id as usize as *mut c_void;

                let rc = match direction {
                    Direction::In => claimed.interface.read_async(
                        pipe.pipe_ref,
                        data.cast(),
                        length,
                        timeout_ms,
                        transfer_completed,
                        refcon,
                    ),
                    Direction::Out => claimed.interface.write_async(
                        pipe.pipe_ref,
                        data.cast(),
                        length,
                        timeout_ms,
                        transfer_completed,
                        refcon,
                    ),
                };
                check(rc, &operation)
            })
            .map(|_| ())
    }

    fn supports_native_timeout(&self, transfer_type: TransferType) -> bool {
        transfer_type == TransferType::Bulk
    }

    fn abort_transfers(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        if endpoint.transfer_type == TransferType::Control {
            return check(self.device.abort_control(), "aborting control transfers");
        }

        let (claimed, pipe) = self.pipe(endpoint)?;
        claimed.interface.abort_pipe(pipe.pipe_ref)
    }

    fn clear_halt(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        let (claimed, pipe) = self.pipe(endpoint)?;
        claimed.interface.clear_stall(pipe.pipe_ref)
    }

    fn result_translator(&self) -> ResultTranslator {
        translate_ioreturn
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        for claimed in self.interfaces.values() {
            for pipe in claimed.pipes.values() {
                if let Err(error) = claimed.interface.abort_pipe(pipe.pipe_ref) {
                    debug!("could not abort pipe {}: {error}", pipe.pipe_ref);
                }
            }
        }
        self.device.abort_control();

        if !self.engine.index.wait_until_drained(self.token, CLOSE_DRAIN_TIMEOUT) {
            let failed = self.engine.index.fail_pending(self.token, i64::from(kIOReturnNoDevice));
            warn!("device {} closed with {failed} requests never completed", self.token);
        }

        for (_, claimed) in self.interfaces.drain() {
            self.engine.remove_source(claimed.source);
        }
        self.engine.remove_source(self.source);
        self.device.close();
        debug!("closed IOKit device {}", self.token);
    }
}

impl Drop for MacOsDevice {
    fn drop(&mut self) {
        self.close();
    }
}
