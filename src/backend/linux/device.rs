//! An open usbfs device node.

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use libc::c_void;
use log::{debug, warn};

use super::engine::LinuxEngine;
use super::usbfs::{self, Urb, URB_TYPE_BULK, URB_TYPE_CONTROL, URB_TYPE_INTERRUPT};
use super::{os_error, translate_errno};
use crate::backend::{BackendDevice, ControlTarget, EndpointInfo};
use crate::descriptor::{TransferType, CONFIGURATION_HEADER_SIZE, DEVICE_DESCRIPTOR_SIZE};
use crate::error::{Error, ResultTranslator, UsbResult};
use crate::request::DescriptorType;
use crate::transfer::{Rejected, Transfer};

/// How long closing waits for cancelled URBs before giving up on them.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) struct LinuxDevice {
    engine: Arc<LinuxEngine>,
    fd: Arc<OwnedFd>,
    token: u64,
    device_descriptor: Vec<u8>,
    configuration_descriptor: Vec<u8>,

    /// Interfaces whose kernel driver was detached when we claimed them.
    detached: Vec<u8>,
    open: bool,
}

impl LinuxDevice {
    /// Opens a usbfs device node, and registers it with the engine.
    pub(crate) fn open(
        engine: Arc<LinuxEngine>,
        path: &str,
        active_configuration: Option<u8>,
    ) -> UsbResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => Error::DeviceNotFound,
                _ => os_error(&format!("opening {path}"), error),
            })?;

        // Reading the node yields the device descriptor and then every configuration descriptor.
        let mut descriptors = vec![];
        file.read_to_end(&mut descriptors)
            .map_err(|error| os_error(&format!("reading descriptors from {path}"), error))?;
        let (device_descriptor, configuration_descriptor) =
            split_descriptors(&descriptors, active_configuration)?;

        let fd = Arc::new(OwnedFd::from(file));
        let token = engine.register(Arc::clone(&fd))?;

        Ok(LinuxDevice {
            engine,
            fd,
            token,
            device_descriptor,
            configuration_descriptor,
            detached: vec![],
            open: true,
        })
    }

    fn submit_urb(
        &mut self,
        urb_type: u8,
        endpoint_address: u8,
        transfer: Transfer,
    ) -> Result<(), Rejected> {
        let fd = self.fd.as_fd();

        self.engine
            .index
            .submit(self.token, endpoint_address, transfer, |id, urb, transfer| {
                // Control URBs carry the setup packet in front of the data.
                let (buffer, length) = match urb_type {
                    URB_TYPE_CONTROL => transfer.native_buffer(),
                    _ => transfer.native_data(),
                };
                let length = i32::try_from(length).map_err(|_| {
                    Error::InvalidArgument(format!("transfer of {length} bytes is too long"))
                })?;

                *urb = Urb {
                    urb_type,
                    endpoint: endpoint_address,
                    buffer: buffer.cast(),
                    buffer_length: length,
                    usercontext: id as usize as *mut c_void,
                    ..Urb::default()
                };

                unsafe { usbfs::submit_urb(fd, urb) }.map_err(|error| {
                    os_error(
                        &format!("submitting transfer on endpoint {endpoint_address:#04x}"),
                        error,
                    )
                })
            })
            .map(|_| ())
    }

    /// Cancels the device's pending URBs; one endpoint's, or all of them.
    fn discard(&self, endpoint_address: Option<u8>) {
        let fd = self.fd.as_fd();

        self.engine
            .index
            .for_each_pending(self.token, endpoint_address, |id, urb| {
                if let Err(error) = unsafe { usbfs::discard_urb(fd, urb) } {
                    // EINVAL means the URB completed in the meantime.
                    if error.raw_os_error() != Some(libc::EINVAL) {
                        warn!("could not cancel transfer {id}: {error}");
                    }
                }
            });
    }
}

/// Splits the contents of a usbfs node into the device descriptor and the descriptor of the
/// active configuration; falls back to the first configuration if the active one is unknown.
pub(crate) fn split_descriptors(
    raw: &[u8],
    active_configuration: Option<u8>,
) -> UsbResult<(Vec<u8>, Vec<u8>)> {
    if raw.len() < DEVICE_DESCRIPTOR_SIZE {
        return Err(Error::InvalidDescriptor(format!(
            "usbfs node holds only {} bytes of descriptors",
            raw.len()
        )));
    }

    let (device, mut rest) = raw.split_at(DEVICE_DESCRIPTOR_SIZE);
    let mut first = None;

    while rest.len() >= CONFIGURATION_HEADER_SIZE {
        let total = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest[1] != DescriptorType::Configuration as u8
            || total < CONFIGURATION_HEADER_SIZE
            || total > rest.len()
        {
            break;
        }

        let (configuration, remaining) = rest.split_at(total);
        if active_configuration == Some(configuration[5]) {
            return Ok((device.to_vec(), configuration.to_vec()));
        }
        first.get_or_insert(configuration);
        rest = remaining;
    }

    first
        .map(|configuration| (device.to_vec(), configuration.to_vec()))
        .ok_or_else(|| Error::InvalidDescriptor("device has no configuration descriptor".into()))
}

impl BackendDevice for LinuxDevice {
    fn device_descriptor(&self) -> &[u8] {
        &self.device_descriptor
    }

    fn configuration_descriptor(&self) -> &[u8] {
        &self.configuration_descriptor
    }

    fn claim_interface(&mut self, interface: u8, detach_kernel_driver: bool) -> UsbResult<()> {
        let operation = format!("claiming interface {interface}");

        if detach_kernel_driver {
            usbfs::disconnect_claim(self.fd.as_fd(), interface)
                .map_err(|error| os_error(&operation, error))?;
            self.detached.push(interface);
        } else {
            usbfs::claim_interface(self.fd.as_fd(), interface)
                .map_err(|error| os_error(&operation, error))?;
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> UsbResult<()> {
        usbfs::release_interface(self.fd.as_fd(), interface)
            .map_err(|error| os_error(&format!("releasing interface {interface}"), error))?;

        if let Some(position) = self.detached.iter().position(|detached| *detached == interface) {
            self.detached.remove(position);
            if let Err(error) = usbfs::reattach_kernel_driver(self.fd.as_fd(), interface) {
                warn!("could not reattach kernel driver to interface {interface}: {error}");
            }
        }
        Ok(())
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> UsbResult<()> {
        usbfs::set_interface(self.fd.as_fd(), interface, setting).map_err(|error| {
            os_error(
                &format!("selecting alternate setting {setting} of interface {interface}"),
                error,
            )
        })
    }

    fn submit_control(&mut self, _target: ControlTarget, transfer: Transfer) -> Result<(), Rejected> {
        self.submit_urb(URB_TYPE_CONTROL, 0, transfer)
    }

    fn submit(
        &mut self,
        endpoint: &EndpointInfo,
        transfer: Transfer,
        _timeout: Option<Duration>,
    ) -> Result<(), Rejected> {
        let urb_type = match endpoint.transfer_type {
            TransferType::Interrupt => URB_TYPE_INTERRUPT,
            _ => URB_TYPE_BULK,
        };
        self.submit_urb(urb_type, endpoint.address(), transfer)
    }

    fn abort_transfers(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        self.discard(Some(endpoint.address()));
        Ok(())
    }

    fn clear_halt(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        usbfs::clear_halt(self.fd.as_fd(), endpoint.address()).map_err(|error| {
            os_error(&format!("clearing halt on endpoint {:#04x}", endpoint.address()), error)
        })
    }

    fn result_translator(&self) -> ResultTranslator {
        translate_errno
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        self.discard(None);
        if !self.engine.index.wait_until_drained(self.token, CLOSE_DRAIN_TIMEOUT) {
            let failed = self.engine.index.fail_pending(self.token, i64::from(libc::ENODEV));
            warn!("device {} closed with {failed} transfers never reaped", self.token);
        }

        for interface in std::mem::take(&mut self.detached) {
            let reattached = usbfs::release_interface(self.fd.as_fd(), interface)
                .and_then(|_| usbfs::reattach_kernel_driver(self.fd.as_fd(), interface));
            if let Err(error) = reattached {
                warn!("could not reattach kernel driver to interface {interface}: {error}");
            }
        }

        self.engine.unregister(self.token);
        debug!("closed usbfs device {}", self.token);
    }
}

impl Drop for LinuxDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{sample_configuration, sample_device_descriptor};

    fn second_configuration() -> Vec<u8> {
        vec![9, 2, 9, 0, 0, 2, 0, 0x80, 50]
    }

    #[test]
    fn picks_the_active_configuration() {
        let mut raw = sample_device_descriptor();
        raw.extend(sample_configuration());
        raw.extend(second_configuration());

        let (device, configuration) = split_descriptors(&raw, Some(2)).unwrap();
        assert_eq!(device, sample_device_descriptor());
        assert_eq!(configuration, second_configuration());

        let (_, configuration) = split_descriptors(&raw, None).unwrap();
        assert_eq!(configuration, sample_configuration());
    }

    #[test]
    fn rejects_nodes_without_configurations() {
        assert!(split_descriptors(&sample_device_descriptor(), None).is_err());
        assert!(split_descriptors(&[18, 1, 0], None).is_err());
    }
}
