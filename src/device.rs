//! Interface for working with USB devices.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use crate::backend::{BackendDevice, ControlTarget, EndpointInfo};
use crate::descriptor::{self, Configuration, Interface, TransferType};
use crate::error::{Error, ResultTranslator, UsbResult};
use crate::request::{ControlRequest, Direction, Recipient};
use crate::stream::{EndpointReader, EndpointWriter};
use crate::transfer::{Rejected, Transfer};

/// Contains known information for an unopened device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    /// The Vendor ID (idVendor) assigned to the device.
    pub vendor_id: u16,

    /// The Product ID (idProduct) associated with the device.
    pub product_id: u16,

    /// The serial string associated with the device, if we were able to get one.
    pub serial: Option<String>,

    pub manufacturer: Option<String>,
    pub product: Option<String>,

    pub bus_number: Option<u8>,
    pub device_address: Option<u8>,

    /// Backend-specific location for devices that are opened by path (Linux, Windows).
    pub backend_path: Option<String>,

    /// Backend-specific location for devices that are opened by number (macOS location ID).
    pub backend_numeric_location: Option<u64>,
}

/// Information used to find a specific device.
#[derive(Debug, Default, Clone)]
pub struct DeviceSelector {
    /// If specified, searches for a device with the given VID.
    pub vendor_id: Option<u16>,

    /// If specified, searches for a device with the given PID.
    pub product_id: Option<u16>,

    /// If specified, searches for a device with the given serial string.
    pub serial: Option<String>,
}

impl DeviceSelector {
    pub fn matches(&self, device: &DeviceInformation) -> bool {
        if let Some(vid) = self.vendor_id {
            if vid != device.vendor_id {
                return false;
            }
        }

        if let Some(pid) = self.product_id {
            if pid != device.product_id {
                return false;
            }
        }

        if let Some(serial) = &self.serial {
            if device.serial.as_ref() != Some(serial) {
                return false;
            }
        }

        true
    }
}

/// Per-interface bookkeeping of an open device.
#[derive(Debug)]
struct InterfaceState {
    number: u8,
    claimed: bool,
    current_alternate: u8,
}

#[derive(Debug)]
struct DeviceState {
    /// None once the device has been closed.
    backend: Option<Box<dyn BackendDevice>>,
    interfaces: Vec<InterfaceState>,
}

/// Shared core of a [Device]; also held by the device's streams.
pub(crate) struct DeviceInner {
    information: DeviceInformation,
    device_descriptor: Vec<u8>,
    configuration_descriptor: Vec<u8>,
    configuration: Configuration,
    translate: ResultTranslator,

    /// Serializes every operation that touches the native device.
    state: Mutex<DeviceState>,
}

/// An open USB device. Cloning produces another handle onto the same open device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Wraps a freshly-opened backend device.
    pub(crate) fn from_backend_device(
        information: DeviceInformation,
        backend_device: Box<dyn BackendDevice>,
    ) -> UsbResult<Self> {
        let device_descriptor = backend_device.device_descriptor().to_vec();
        let configuration_descriptor = backend_device.configuration_descriptor().to_vec();
        let configuration = descriptor::parse_configuration(&configuration_descriptor)?;
        let translate = backend_device.result_translator();

        let interfaces = configuration
            .interfaces
            .iter()
            .map(|interface| InterfaceState {
                number: interface.number,
                claimed: false,
                current_alternate: interface.alternates.first().map_or(0, |alt| alt.number),
            })
            .collect();

        Ok(Device {
            inner: Arc::new(DeviceInner {
                information,
                device_descriptor,
                configuration_descriptor,
                configuration,
                translate,
                state: Mutex::new(DeviceState {
                    backend: Some(backend_device),
                    interfaces,
                }),
            }),
        })
    }

    pub fn information(&self) -> &DeviceInformation {
        &self.inner.information
    }

    /// The raw device descriptor, as read when the device was opened.
    pub fn device_descriptor(&self) -> &[u8] {
        &self.inner.device_descriptor
    }

    /// The raw descriptor of the active configuration, as read when the device was opened.
    pub fn configuration_descriptor(&self) -> &[u8] {
        &self.inner.configuration_descriptor
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.inner.configuration.interfaces
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().backend.is_some()
    }

    /// Returns true if the interface is currently claimed through this device.
    pub fn is_claimed(&self, interface: u8) -> bool {
        self.inner
            .lock()
            .interfaces
            .iter()
            .any(|state| state.number == interface && state.claimed)
    }

    /// Returns the alternate setting currently selected for an interface.
    pub fn current_alternate_setting(&self, interface: u8) -> Option<u8> {
        self.inner
            .lock()
            .interfaces
            .iter()
            .find(|state| state.number == interface)
            .map(|state| state.current_alternate)
    }

    /// Closes the device: cancels everything in flight, waits for those completions,
    /// and releases the native handle. Further operations fail with [Error::DeviceNotOpen].
    pub fn close(&self) {
        self.inner.close();
    }

    /// Claims an interface for exclusive use. Required before any transfer on its endpoints.
    pub fn claim_interface(&self, interface: u8) -> UsbResult<()> {
        self.inner.claim_interface(interface, false)
    }

    /// Claims an interface, detaching any kernel driver bound to it first.
    /// The driver is reattached when the interface is released.
    pub fn detach_and_claim_interface(&self, interface: u8) -> UsbResult<()> {
        self.inner.claim_interface(interface, true)
    }

    pub fn release_interface(&self, interface: u8) -> UsbResult<()> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let backend = state.backend.as_mut().ok_or(Error::DeviceNotOpen)?;

        let interface_state = find_interface(&mut state.interfaces, interface)?;
        if !interface_state.claimed {
            return Err(Error::InvalidState(format!(
                "interface {interface} has not been claimed"
            )));
        }

        backend.release_interface(interface)?;
        interface_state.claimed = false;
        Ok(())
    }

    /// Selects an alternate setting for a claimed interface.
    pub fn select_alternate_setting(&self, interface: u8, alternate: u8) -> UsbResult<()> {
        let exists = self
            .inner
            .configuration
            .interface(interface)
            .map_or(false, |found| found.alternate(alternate).is_some());
        if !exists {
            return Err(Error::InvalidArgument(format!(
                "interface {interface} does not have an alternate interface setting {alternate}"
            )));
        }

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let backend = state.backend.as_mut().ok_or(Error::DeviceNotOpen)?;

        let interface_state = find_interface(&mut state.interfaces, interface)?;
        if !interface_state.claimed {
            return Err(Error::InvalidState(format!(
                "interface {interface} must be claimed before selecting an alternate setting"
            )));
        }

        backend.set_alternate_setting(interface, alternate)?;
        interface_state.current_alternate = alternate;
        Ok(())
    }

    /// Performs a control transfer with an IN data stage of up to `length` bytes.
    pub fn control_transfer_in(
        &self,
        request: &ControlRequest,
        length: u16,
        timeout: Option<Duration>,
    ) -> UsbResult<Vec<u8>> {
        let setup = request.setup_packet(Direction::In, length);
        let transfer = Transfer::control(setup, &vec![0; length as usize]);

        let completed = self
            .inner
            .transfer_sync(&EndpointInfo::control(), transfer, timeout)?;
        Ok(completed.into_data())
    }

    /// Performs a control transfer with an optional OUT data stage.
    pub fn control_transfer_out(
        &self,
        request: &ControlRequest,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> UsbResult<()> {
        let length = u16::try_from(data.len()).map_err(|_| {
            Error::InvalidArgument(format!(
                "control transfer data stage of {} bytes is too long",
                data.len()
            ))
        })?;

        let setup = request.setup_packet(Direction::Out, length);
        let transfer = Transfer::control(setup, data);

        self.inner
            .transfer_sync(&EndpointInfo::control(), transfer, timeout)?;
        Ok(())
    }

    /// Receives one packet from a bulk or interrupt IN endpoint.
    ///
    /// A timeout of None, or of zero, waits forever.
    pub fn transfer_in(&self, endpoint: u8, timeout: Option<Duration>) -> UsbResult<Vec<u8>> {
        let endpoint = self.inner.endpoint(
            Direction::In,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        )?;

        let transfer = Transfer::with_length(endpoint.packet_size as usize);
        let completed = self.inner.transfer_sync(&endpoint, transfer, timeout)?;
        Ok(completed.into_data())
    }

    /// Sends data to a bulk or interrupt OUT endpoint.
    ///
    /// A timeout of None, or of zero, waits forever.
    pub fn transfer_out(&self, endpoint: u8, data: &[u8], timeout: Option<Duration>) -> UsbResult<()> {
        let endpoint = self.inner.endpoint(
            Direction::Out,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        )?;

        self.inner
            .transfer_sync(&endpoint, Transfer::new(data.to_vec()), timeout)?;
        Ok(())
    }

    /// Aborts every transfer pending on an endpoint. The aborted transfers fail.
    pub fn abort_transfers(&self, direction: Direction, endpoint: u8) -> UsbResult<()> {
        let endpoint = self.inner.endpoint(
            direction,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        )?;
        self.inner.abort(&endpoint)
    }

    /// Clears the halt condition of an endpoint, after it has stalled.
    pub fn clear_halt(&self, direction: Direction, endpoint: u8) -> UsbResult<()> {
        let endpoint = self.inner.endpoint(
            direction,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        )?;

        let mut state = self.inner.lock();
        let backend = state.backend.as_mut().ok_or(Error::DeviceNotOpen)?;
        backend.clear_halt(&endpoint)
    }

    /// Opens a buffered, pipelined reader on a bulk IN endpoint.
    ///
    /// `buffer_size_hint` is the approximate number of bytes to keep in flight.
    pub fn open_input_stream(&self, endpoint: u8, buffer_size_hint: usize) -> UsbResult<EndpointReader> {
        let endpoint = self
            .inner
            .endpoint(Direction::In, endpoint, &[TransferType::Bulk])?;
        EndpointReader::new(Arc::clone(&self.inner), endpoint, buffer_size_hint)
    }

    /// Opens a buffered, pipelined writer on a bulk OUT endpoint.
    pub fn open_output_stream(&self, endpoint: u8, buffer_size_hint: usize) -> UsbResult<EndpointWriter> {
        let endpoint = self
            .inner
            .endpoint(Direction::Out, endpoint, &[TransferType::Bulk])?;
        EndpointWriter::new(Arc::clone(&self.inner), endpoint, buffer_size_hint)
    }

    /// Looks up a usable endpoint of a claimed interface.
    pub(crate) fn endpoint(
        &self,
        direction: Direction,
        number: u8,
        allowed: &[TransferType],
    ) -> UsbResult<EndpointInfo> {
        self.inner.endpoint(direction, number, allowed)
    }

    /// Submits a transfer without waiting for it; `on_complete` runs on the engine thread.
    pub(crate) fn submit_in_background<F>(
        &self,
        endpoint: &EndpointInfo,
        mut transfer: Transfer,
        on_complete: F,
    ) -> UsbResult<()>
    where
        F: FnOnce(UsbResult<Transfer>) + Send + 'static,
    {
        let translate = self.inner.translate;
        let operation = endpoint.describe();
        transfer.set_completion(move |transfer| {
            on_complete(check_result(translate, transfer, &operation))
        });

        self.inner.submit(endpoint, transfer, None)?;
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("information", &self.inner.information)
            .field("open", &self.is_open())
            .finish()
    }
}

fn find_interface(interfaces: &mut [InterfaceState], number: u8) -> UsbResult<&mut InterfaceState> {
    interfaces
        .iter_mut()
        .find(|state| state.number == number)
        .ok_or_else(|| Error::InvalidArgument(format!("interface {number} does not exist")))
}

/// Converts a completed transfer into an error if the OS reported one.
pub(crate) fn check_result(
    translate: ResultTranslator,
    transfer: Transfer,
    operation: &str,
) -> UsbResult<Transfer> {
    match transfer.result_code() {
        0 => Ok(transfer),
        code => Err(translate(code, &format!("{operation} failed"))),
    }
}

impl DeviceInner {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn translator(&self) -> ResultTranslator {
        self.translate
    }

    fn claim_interface(&self, interface: u8, detach: bool) -> UsbResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let backend = state.backend.as_mut().ok_or(Error::DeviceNotOpen)?;

        let interface_state = find_interface(&mut state.interfaces, interface)?;
        if interface_state.claimed {
            return Err(Error::InvalidState(format!(
                "interface {interface} has already been claimed"
            )));
        }

        backend.claim_interface(interface, detach)?;
        interface_state.claimed = true;
        debug!("claimed interface {interface}");
        Ok(())
    }

    /// Finds an endpoint in the current alternate setting of a claimed interface.
    pub(crate) fn endpoint(
        &self,
        direction: Direction,
        number: u8,
        allowed: &[TransferType],
    ) -> UsbResult<EndpointInfo> {
        let state = self.lock();
        if state.backend.is_none() {
            return Err(Error::DeviceNotOpen);
        }

        if (1..=127).contains(&number) {
            for interface_state in state.interfaces.iter().filter(|state| state.claimed) {
                let alternate = self
                    .configuration
                    .interface(interface_state.number)
                    .and_then(|interface| interface.alternate(interface_state.current_alternate));

                let found = alternate.and_then(|alternate| {
                    alternate.endpoints.iter().find(|endpoint| {
                        endpoint.number == number && endpoint.direction == direction
                    })
                });

                if let Some(endpoint) = found {
                    if allowed.contains(&endpoint.transfer_type) {
                        return Ok(EndpointInfo {
                            interface_number: interface_state.number,
                            number,
                            direction,
                            transfer_type: endpoint.transfer_type,
                            packet_size: endpoint.max_packet_size,
                        });
                    }
                }
            }
        }

        let types: Vec<&str> = allowed.iter().map(|kind| kind.name()).collect();
        Err(Error::InvalidEndpoint(format!(
            "endpoint number {number} does not exist, is not part of a claimed interface \
             or is not valid for {} transfer in {} direction",
            types.join(" or "),
            direction.name()
        )))
    }

    /// Works out where a control transfer is headed, from its setup packet.
    fn control_target(
        interfaces: &[InterfaceState],
        configuration: &Configuration,
        setup: &[u8],
    ) -> ControlTarget {
        let index = u16::from_le_bytes([setup[4], setup[5]]);

        match setup[0] & 0x1f {
            r if r == Recipient::Device as u8 => ControlTarget::Device,
            r if r == Recipient::Interface as u8 => ControlTarget::Interface((index & 0xff) as u8),
            r if r == Recipient::Endpoint as u8 => {
                let address = (index & 0xff) as u8;
                let direction = Direction::from_address(address);
                let number = address & 0x7f;

                let interface = interfaces
                    .iter()
                    .filter(|state| state.claimed)
                    .find(|interface_state| {
                        configuration
                            .interface(interface_state.number)
                            .and_then(|interface| interface.alternate(interface_state.current_alternate))
                            .map_or(false, |alternate| {
                                alternate.endpoints.iter().any(|endpoint| {
                                    endpoint.number == number && endpoint.direction == direction
                                })
                            })
                    })
                    .map(|state| state.number);

                ControlTarget::Endpoint { address, interface }
            }
            _ => ControlTarget::Other,
        }
    }

    /// Hands a transfer to the backend. Returns whether the backend took over the timeout.
    pub(crate) fn submit(
        &self,
        endpoint: &EndpointInfo,
        transfer: Transfer,
        timeout: Option<Duration>,
    ) -> Result<bool, Rejected> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(backend) = state.backend.as_mut() else {
            return Err(Rejected {
                error: Error::DeviceNotOpen,
                transfer,
            });
        };

        if endpoint.transfer_type == TransferType::Control {
            let target = transfer
                .setup_packet()
                .map(|setup| Self::control_target(&state.interfaces, &self.configuration, setup));

            let Some(target) = target else {
                return Err(Rejected {
                    error: Error::Internal("control transfer without a setup packet".into()),
                    transfer,
                });
            };

            backend.submit_control(target, transfer)?;
            return Ok(false);
        }

        let native = timeout.filter(|timeout| !timeout.is_zero()).filter(|_| {
            backend.supports_native_timeout(endpoint.transfer_type)
        });
        backend.submit(endpoint, transfer, native)?;
        Ok(native.is_some())
    }

    /// Cancels the transfers pending on an endpoint; the cancellations still complete.
    pub(crate) fn abort(&self, endpoint: &EndpointInfo) -> UsbResult<()> {
        let mut state = self.lock();
        let backend = state.backend.as_mut().ok_or(Error::DeviceNotOpen)?;
        debug!("aborting transfers on endpoint {:#04x}", endpoint.address());
        backend.abort_transfers(endpoint)
    }

    /// Submits a transfer and blocks until it has completed.
    fn transfer_sync(
        &self,
        endpoint: &EndpointInfo,
        mut transfer: Transfer,
        timeout: Option<Duration>,
    ) -> UsbResult<Transfer> {
        let (sender, completed) = mpsc::sync_channel(1);
        transfer.set_completion(move |transfer| {
            // The waiter only leaves early if the channel itself is gone.
            let _ = sender.send(transfer);
        });

        let native_timeout = self.submit(endpoint, transfer, timeout)?;
        let local_timeout = if native_timeout { None } else { timeout };
        self.wait_for_transfer(completed, local_timeout, endpoint)
    }

    /// Waits for a submitted transfer to complete.
    ///
    /// With a timeout, an expired wait aborts the endpoint and then keeps waiting until the
    /// aborted transfer has actually completed; only then does it report the timeout. If the
    /// abort itself fails, the wait still lasts until the OS completes the transfer, and the
    /// abort's error is reported unless the transfer succeeded after all.
    pub(crate) fn wait_for_transfer(
        &self,
        completed: Receiver<Transfer>,
        timeout: Option<Duration>,
        endpoint: &EndpointInfo,
    ) -> UsbResult<Transfer> {
        let operation = endpoint.describe();
        let lost = || Error::Internal(format!("{operation} was dropped without completing"));

        let transfer = match timeout.filter(|timeout| !timeout.is_zero()) {
            None => completed.recv().map_err(|_| lost())?,
            Some(timeout) => match completed.recv_timeout(timeout) {
                Ok(transfer) => transfer,
                Err(RecvTimeoutError::Disconnected) => return Err(lost()),
                Err(RecvTimeoutError::Timeout) => {
                    debug!("{operation} timed out after {timeout:?}; aborting it");
                    let aborted = self.abort(endpoint);
                    if let Err(error) = &aborted {
                        warn!("could not abort {operation}; waiting for it to finish: {error}");
                    }

                    let transfer = completed.recv().map_err(|_| lost())?;
                    if transfer.result_code() != 0 {
                        aborted?;
                        return Err(Error::TimedOut(operation));
                    }

                    // It completed in the window between the deadline and the abort.
                    transfer
                }
            },
        };

        check_result(self.translate, transfer, &operation)
    }

    fn close(&self) {
        let mut state = self.lock();
        if let Some(mut backend) = state.backend.take() {
            backend.close();
            debug!("closed device {:04x}:{:04x}", self.information.vendor_id, self.information.product_id);
        }

        for interface in state.interfaces.iter_mut() {
            interface.claimed = false;
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let backend = self.lock().backend.take();
        if let Some(mut backend) = backend {
            debug!("device dropped while open; closing it");
            backend.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::backend::mock::{self, MockHandle};
    use crate::descriptor::tests::sample_device_descriptor;
    use crate::request::{DescriptorType, StandardDeviceRequest, Type};

    fn open_claimed() -> (Device, MockHandle) {
        let (device, handle) = mock::open_mock_device();
        device.claim_interface(0).unwrap();
        (device, handle)
    }

    fn get_device_descriptor() -> ControlRequest {
        ControlRequest::standard(
            StandardDeviceRequest::GetDescriptor,
            (DescriptorType::Device as u16) << 8,
            0,
        )
    }

    #[test]
    fn control_in_round_trip() {
        let (device, handle) = mock::open_mock_device();
        handle.set_control_response(&sample_device_descriptor());

        let data = device
            .control_transfer_in(&get_device_descriptor(), 18, None)
            .unwrap();
        assert_eq!(data, sample_device_descriptor());

        let hardware = handle.hardware();
        assert_eq!(hardware.setups, vec![[0x80, 6, 0, 1, 0, 0, 18, 0]]);
        assert_eq!(hardware.control_targets, vec![ControlTarget::Device]);
    }

    #[test]
    fn control_in_returns_short_responses() {
        let (device, handle) = mock::open_mock_device();
        handle.set_control_response(&[1, 2, 3]);

        let data = device
            .control_transfer_in(&get_device_descriptor(), 255, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn control_out_sends_data_stage() {
        let (device, handle) = mock::open_mock_device();
        let request = ControlRequest::vendor(0x23, 0x1234, 0);

        device.control_transfer_out(&request, &[1, 2, 3], None).unwrap();

        let hardware = handle.hardware();
        assert_eq!(hardware.setups, vec![[0x40, 0x23, 0x34, 0x12, 0, 0, 3, 0]]);
        assert_eq!(hardware.control_written, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn endpoint_requests_are_routed_to_the_owning_interface() {
        let (device, handle) = open_claimed();
        let clear_feature = ControlRequest {
            request_type: Type::Standard,
            recipient: Recipient::Endpoint,
            request: StandardDeviceRequest::ClearFeature.into(),
            value: 0,
            index: 0x81,
        };
        device.control_transfer_out(&clear_feature, &[], None).unwrap();

        let to_unclaimed = ControlRequest {
            index: 0x84,
            ..clear_feature
        };
        device.control_transfer_out(&to_unclaimed, &[], None).unwrap();

        assert_eq!(
            handle.hardware().control_targets,
            vec![
                ControlTarget::Endpoint {
                    address: 0x81,
                    interface: Some(0)
                },
                ControlTarget::Endpoint {
                    address: 0x84,
                    interface: None
                },
            ]
        );
    }

    #[test]
    fn control_stall_is_reported() {
        let (device, handle) = mock::open_mock_device();
        handle.fail_next_control(mock::STALL);

        let error = device
            .control_transfer_in(&get_device_descriptor(), 18, None)
            .unwrap_err();
        assert!(error.is_stall());
        assert_eq!(error.os_code(), Some(mock::STALL));
    }

    #[test]
    fn transfer_in_reads_one_packet() {
        let (device, handle) = open_claimed();
        handle.feed(0x81, &[9; 10]);

        assert_eq!(device.transfer_in(1, None).unwrap(), vec![9; 10]);
    }

    #[test]
    fn transfer_out_sends_everything() {
        let (device, handle) = open_claimed();
        device
            .transfer_out(2, b"abc", Some(Duration::from_secs(1)))
            .unwrap();

        assert_eq!(handle.hardware().written, vec![(0x02, b"abc".to_vec())]);
    }

    #[test]
    fn timeout_aborts_and_waits_for_the_transfer() {
        let (device, handle) = open_claimed();
        let timeout = Duration::from_millis(50);

        let started = Instant::now();
        let error = device.transfer_in(1, Some(timeout)).unwrap_err();

        assert!(started.elapsed() >= timeout);
        assert_eq!(error, Error::TimedOut("transfer IN on endpoint 1".into()));
        assert_eq!(error.to_string(), "transfer IN on endpoint 1 aborted due to timeout");
        assert_eq!(handle.hardware().aborted, vec![0x81]);
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn control_timeout_aborts_the_default_pipe() {
        let (device, handle) = mock::open_mock_device();
        handle.hold_control(true);
        let timeout = Duration::from_millis(50);

        let started = Instant::now();
        let error = device
            .control_transfer_in(&get_device_descriptor(), 18, Some(timeout))
            .unwrap_err();

        assert!(started.elapsed() >= timeout);
        assert_eq!(error, Error::TimedOut("control transfer".into()));
        assert_eq!(handle.hardware().aborted, vec![0]);
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn failed_abort_still_waits_for_the_transfer() {
        let (device, handle) = open_claimed();
        handle.fail_aborts(5);

        let reader = {
            let device = device.clone();
            thread::spawn(move || device.transfer_in(1, Some(Duration::from_millis(20))))
        };
        handle.wait_for(|hardware| hardware.aborted == [0x81]);

        // The device still holds the transfer, so the caller keeps waiting.
        thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());
        assert_eq!(handle.pending(), 1);

        handle.complete_waiting(0x81, mock::CANCELLED);
        let error = reader.join().unwrap().unwrap_err();
        assert!(matches!(error, Error::OsError { code: 5, .. }), "{error:?}");
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn stall_then_clear_halt() {
        let (device, handle) = open_claimed();
        handle.feed_status(0x81, mock::STALL);

        let error = device.transfer_in(1, None).unwrap_err();
        assert!(error.is_stall(), "{error:?}");

        device.clear_halt(Direction::In, 1).unwrap();
        assert_eq!(handle.hardware().cleared, vec![0x81]);

        handle.feed(0x81, &[1]);
        assert_eq!(device.transfer_in(1, None).unwrap(), vec![1]);
    }

    #[test]
    fn endpoints_must_belong_to_a_claimed_interface() {
        let (device, _handle) = mock::open_mock_device();
        assert!(matches!(device.transfer_in(1, None), Err(Error::InvalidEndpoint(_))));

        device.claim_interface(0).unwrap();
        // Wrong direction.
        assert!(matches!(device.transfer_in(2, None), Err(Error::InvalidEndpoint(_))));
        // Interrupt endpoints can't be streamed.
        assert!(matches!(device.open_input_stream(3, 0), Err(Error::InvalidEndpoint(_))));
        // Endpoint numbers are 1..=127.
        assert!(matches!(device.transfer_out(0, &[], None), Err(Error::InvalidEndpoint(_))));

        let Err(Error::InvalidEndpoint(message)) = device.open_output_stream(4, 0) else {
            panic!("endpoint 4 should not be available yet");
        };
        assert_eq!(
            message,
            "endpoint number 4 does not exist, is not part of a claimed interface or is not \
             valid for bulk transfer in OUT direction"
        );
    }

    #[test]
    fn alternate_settings_change_the_available_endpoints() {
        let (device, handle) = mock::open_mock_device();
        assert!(matches!(
            device.select_alternate_setting(1, 1),
            Err(Error::InvalidState(_))
        ));

        device.claim_interface(1).unwrap();
        assert!(device.open_input_stream(4, 0).is_err());
        assert!(matches!(
            device.select_alternate_setting(1, 5),
            Err(Error::InvalidArgument(_))
        ));

        device.select_alternate_setting(1, 1).unwrap();
        assert_eq!(device.current_alternate_setting(1), Some(1));
        assert!(device.open_input_stream(4, 0).is_ok());
        assert_eq!(handle.hardware().alternates, vec![(1, 1)]);
    }

    #[test]
    fn claim_bookkeeping() {
        let (device, handle) = mock::open_mock_device();

        device.claim_interface(0).unwrap();
        assert!(device.is_claimed(0));
        assert!(matches!(device.claim_interface(0), Err(Error::InvalidState(_))));
        assert!(matches!(device.claim_interface(9), Err(Error::InvalidArgument(_))));
        assert!(matches!(device.release_interface(1), Err(Error::InvalidState(_))));

        device.release_interface(0).unwrap();
        assert!(!device.is_claimed(0));
        assert!(handle.hardware().claimed.is_empty());
    }

    #[test]
    fn closed_device_refuses_everything() {
        let (device, _handle) = open_claimed();
        device.close();
        device.close();

        assert!(!device.is_claimed(0));
        assert_eq!(device.transfer_in(1, None), Err(Error::DeviceNotOpen));
        assert_eq!(
            device.control_transfer_in(&get_device_descriptor(), 18, None),
            Err(Error::DeviceNotOpen)
        );
        assert_eq!(device.claim_interface(0), Err(Error::DeviceNotOpen));
    }

    #[test]
    fn close_completes_blocked_transfers() {
        let (device, handle) = open_claimed();

        let reader = {
            let device = device.clone();
            thread::spawn(move || device.transfer_in(1, None))
        };
        handle.wait_for(|hardware| hardware.waiting_on(0x81) == 1);

        device.close();
        let error = reader.join().unwrap().unwrap_err();
        assert!(matches!(error, Error::Aborted { code: mock::CANCELLED, .. }), "{error:?}");
        assert_eq!(handle.pending(), 0);
    }
}
