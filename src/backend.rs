//! Trait and factory for our per-OS backends.
//! Backends can (and will) contain unsafe code, but they expose a safe interface here.

use std::sync::Arc;
use std::time::Duration;

use crate::descriptor::TransferType;
use crate::device::DeviceInformation;
use crate::error::{ResultTranslator, UsbResult};
use crate::request::Direction;
use crate::transfer::{Rejected, Transfer};

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(test)]
pub(crate) mod mock;

/// Everything a backend needs to know to address one endpoint.
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// The interface whose current alternate setting contains the endpoint.
    pub interface_number: u8,
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub packet_size: u16,
}

impl EndpointInfo {
    /// The default control endpoint, which belongs to no interface in particular.
    pub const fn control() -> Self {
        EndpointInfo {
            interface_number: 0,
            number: 0,
            direction: Direction::Out,
            transfer_type: TransferType::Control,
            packet_size: 64,
        }
    }

    pub fn address(&self) -> u8 {
        match self.transfer_type {
            TransferType::Control => 0,
            _ => self.direction.endpoint_address(self.number),
        }
    }

    /// Human-readable description, as used in error messages.
    pub fn describe(&self) -> String {
        match self.transfer_type {
            TransferType::Control => "control transfer".into(),
            _ => format!(
                "transfer {} on endpoint {}",
                self.direction.name(),
                self.number
            ),
        }
    }
}

/// Which part of the device a control request is aimed at; some backends route control
/// requests through per-interface handles.
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum ControlTarget {
    Device,
    Interface(u8),

    /// An endpoint, plus the claimed interface that owns it; None if no claimed interface does.
    Endpoint {
        address: u8,
        interface: Option<u8>,
    },
    Other,
}

/// Trait that collects the operations a backend performs on one open device.
///
/// All methods are called with the owning device's lock held, so implementations never see
/// concurrent calls for the same device.
pub trait BackendDevice: std::fmt::Debug + Send {
    /// The raw 18-byte device descriptor.
    fn device_descriptor(&self) -> &[u8];

    /// The raw descriptor of the active configuration, including all nested descriptors.
    fn configuration_descriptor(&self) -> &[u8];

    /// Takes exclusive ownership of an interface; optionally detaching any kernel driver first.
    fn claim_interface(&mut self, interface: u8, detach_kernel_driver: bool) -> UsbResult<()>;

    fn release_interface(&mut self, interface: u8) -> UsbResult<()>;

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> UsbResult<()>;

    /// Submits a control transfer; its setup packet is at the front of the transfer buffer.
    fn submit_control(&mut self, target: ControlTarget, transfer: Transfer)
        -> Result<(), Rejected>;

    /// Submits a bulk or interrupt transfer. `timeout` is only ever set when
    /// [BackendDevice::supports_native_timeout] returned true for the endpoint's transfer type.
    fn submit(
        &mut self,
        endpoint: &EndpointInfo,
        transfer: Transfer,
        timeout: Option<Duration>,
    ) -> Result<(), Rejected>;

    /// Returns true if the OS can time out transfers of this type by itself.
    fn supports_native_timeout(&self, _transfer_type: TransferType) -> bool {
        false
    }

    /// Asks the OS to cancel every transfer pending on the endpoint. The cancelled transfers
    /// still complete through the engine, with a cancellation status.
    fn abort_transfers(&mut self, endpoint: &EndpointInfo) -> UsbResult<()>;

    fn clear_halt(&mut self, endpoint: &EndpointInfo) -> UsbResult<()>;

    /// Translator for this backend's raw transfer result codes.
    fn result_translator(&self) -> ResultTranslator;

    /// Cancels everything, waits for outstanding completions, and releases the OS handle.
    /// Must be idempotent.
    fn close(&mut self);
}

/// Trait that unifies all of our OS-specific backends.
pub trait Backend: std::fmt::Debug + Send + Sync {
    /// Returns a collection of device information for all devices present on the system.
    fn get_devices(&self) -> UsbResult<Vec<DeviceInformation>>;

    /// Opens a raw USB device, and returns a backend-specific wrapper around the device.
    fn open(&self, information: &DeviceInformation) -> UsbResult<Box<dyn BackendDevice>>;
}

/// Creates a default backend implementation for Linux machines.
#[cfg(target_os = "linux")]
pub fn create_default_backend() -> UsbResult<Arc<dyn Backend>> {
    Ok(Arc::new(linux::LinuxBackend::new()?))
}

/// Creates a default backend implementation for macOS machines.
#[cfg(target_os = "macos")]
pub fn create_default_backend() -> UsbResult<Arc<dyn Backend>> {
    Ok(Arc::new(macos::MacOsBackend::new()?))
}

/// Creates a default backend implementation for Windows machines.
#[cfg(target_os = "windows")]
pub fn create_default_backend() -> UsbResult<Arc<dyn Backend>> {
    Ok(Arc::new(windows::WindowsBackend::new()?))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn create_default_backend() -> UsbResult<Arc<dyn Backend>> {
    Err(crate::error::Error::SubsystemUnavailable(
        "no USB backend exists for this platform".into(),
    ))
}
