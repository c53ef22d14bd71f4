//! Entry point for finding and opening devices.

use std::sync::Arc;

use log::{debug, trace};

use crate::backend::{create_default_backend, Backend};
use crate::device::{Device, DeviceInformation, DeviceSelector};
use crate::error::{Error, UsbResult};

/// The machine's side of the bus: enumerates the attached devices, and opens them.
///
/// Cheap to create; every Host shares the process-wide completion engine of its backend.
#[derive(Clone)]
pub struct Host {
    backend: Arc<dyn Backend>,
}

impl Host {
    /// Creates a Host on the backend for the platform we were built for.
    pub fn new() -> UsbResult<Self> {
        Self::new_from_backend(create_default_backend()?)
    }

    /// Creates a Host on a caller-supplied backend; used for testing, and for platforms
    /// without a built-in backend.
    pub fn new_from_backend(backend: Arc<dyn Backend>) -> UsbResult<Self> {
        Ok(Host { backend })
    }

    /// Returns the first attached device the selector accepts.
    pub fn device(&self, selector: &DeviceSelector) -> UsbResult<DeviceInformation> {
        self.backend
            .get_devices()?
            .into_iter()
            .find(|candidate| selector.matches(candidate))
            .ok_or(Error::DeviceNotFound)
    }

    /// Returns every attached device the selector accepts, in enumeration order.
    pub fn devices(&self, selector: &DeviceSelector) -> UsbResult<Vec<DeviceInformation>> {
        let found: Vec<_> = self
            .backend
            .get_devices()?
            .into_iter()
            .filter(|candidate| selector.matches(candidate))
            .collect();

        trace!("{} device(s) match {selector:?}", found.len());
        Ok(found)
    }

    pub fn all_devices(&self) -> UsbResult<Vec<DeviceInformation>> {
        self.devices(&DeviceSelector::default())
    }

    /// Opens a previously enumerated device.
    pub fn open(&self, information: &DeviceInformation) -> UsbResult<Device> {
        let backend_device = self.backend.open(information)?;
        debug!(
            "opened device {:04x}:{:04x}",
            information.vendor_id, information.product_id
        );

        Device::from_backend_device(information.clone(), backend_device)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("backend", &self.backend).finish()
    }
}

/// Shorthand for [Host::device] on the platform's backend.
pub fn device(selector: &DeviceSelector) -> UsbResult<DeviceInformation> {
    Host::new()?.device(selector)
}

/// Shorthand for [Host::devices] on the platform's backend.
pub fn devices(selector: &DeviceSelector) -> UsbResult<Vec<DeviceInformation>> {
    Host::new()?.devices(selector)
}

/// Shorthand for [Host::all_devices] on the platform's backend.
pub fn all_devices() -> UsbResult<Vec<DeviceInformation>> {
    Host::new()?.all_devices()
}

/// Shorthand for [Host::open] on the platform's backend.
pub fn open(information: &DeviceInformation) -> UsbResult<Device> {
    Host::new()?.open(information)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn selector_filters_enumeration() {
        let (backend, _handle) = MockBackend::new();
        let host = Host::new_from_backend(Arc::new(backend)).unwrap();

        assert_eq!(host.all_devices().unwrap().len(), 1);

        let selector = DeviceSelector {
            vendor_id: Some(0x1209),
            serial: Some("mock-0001".into()),
            ..Default::default()
        };
        let found = host.device(&selector).unwrap();
        assert_eq!(found.product_id, 0x0001);

        let selector = DeviceSelector {
            product_id: Some(0xbeef),
            ..Default::default()
        };
        assert_eq!(host.device(&selector), Err(Error::DeviceNotFound));
        assert!(host.devices(&selector).unwrap().is_empty());
    }

    #[test]
    fn opened_device_parses_its_configuration() {
        let (backend, _handle) = MockBackend::new();
        let host = Host::new_from_backend(Arc::new(backend)).unwrap();
        let information = host.all_devices().unwrap().remove(0);

        let device = host.open(&information).unwrap();
        assert!(device.is_open());
        assert_eq!(device.information(), &information);
        assert_eq!(device.interfaces().len(), 2);
        assert_eq!(device.device_descriptor().len(), 18);

        device.close();
        assert!(!device.is_open());
    }
}
