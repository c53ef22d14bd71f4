//! Finding USB devices in the IORegistry.

use io_kit_sys::{
    kIOMasterPortDefault, ret::kIOReturnSuccess, types::io_iterator_t,
    usb::lib::kIOUSBDeviceClassName, IOServiceGetMatchingServices, IOServiceMatching,
};
use log::trace;

use super::io_return_error;
use super::iokit::{cfstr, numeric_property, string_property, IoObject};
use crate::device::DeviceInformation;
use crate::error::{Error, UsbResult};

/// Iterator over every IOUSBDevice service currently registered.
fn device_iterator() -> UsbResult<IoObject> {
    unsafe {
        let matcher = IOServiceMatching(kIOUSBDeviceClassName);
        if matcher.is_null() {
            return Err(Error::Internal("could not create an IOKit matching dictionary".into()));
        }

        // Consumes the matching dictionary.
        let mut iterator: io_iterator_t = 0;
        let rc = IOServiceGetMatchingServices(kIOMasterPortDefault, matcher, &mut iterator);
        if rc != kIOReturnSuccess {
            return Err(io_return_error(rc, "listing USB devices"));
        }

        Ok(IoObject::new(iterator))
    }
}

/// Fetches the registry information for a device without opening it.
///
/// `ioreg -p IOUSB -l` shows which properties are available.
fn device_information(service: &IoObject) -> Option<DeviceInformation> {
    // Root hubs and internal devices have no location ID; we can't open those.
    let location: u32 = numeric_property(service, cfstr!("locationID"))?;

    Some(DeviceInformation {
        vendor_id: numeric_property(service, cfstr!("idVendor"))?,
        product_id: numeric_property(service, cfstr!("idProduct"))?,
        serial: string_property(service, cfstr!("USB Serial Number")),
        manufacturer: string_property(service, cfstr!("USB Vendor Name")),
        product: string_property(service, cfstr!("USB Product Name")),
        bus_number: Some((location >> 24) as u8),
        device_address: numeric_property(service, cfstr!("USB Address")),
        backend_path: None,
        backend_numeric_location: Some(u64::from(location)),
    })
}

pub(crate) fn devices() -> UsbResult<Vec<DeviceInformation>> {
    let iterator = device_iterator()?;
    let mut devices = vec![];

    while let Some(service) = iterator.next_object() {
        match device_information(&service) {
            Some(information) => devices.push(information),
            None => trace!("skipping IOKit service {}; no location ID", service.get()),
        }
    }

    Ok(devices)
}

/// Finds the service of the device with the given location ID.
pub(crate) fn find_device(location: u64) -> UsbResult<IoObject> {
    let iterator = device_iterator()?;

    while let Some(service) = iterator.next_object() {
        let candidate: Option<u32> = numeric_property(&service, cfstr!("locationID"));
        if candidate.map(u64::from) == Some(location) {
            return Ok(service);
        }
    }

    Err(Error::DeviceNotFound)
}
