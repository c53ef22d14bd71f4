//! Device enumeration through sysfs.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::trace;

use crate::device::DeviceInformation;
use crate::error::{Error, UsbResult};

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

fn attribute(directory: &Path, name: &str) -> Option<String> {
    fs::read_to_string(directory.join(name))
        .ok()
        .map(|value| value.trim().to_string())
}

fn hex_attribute(directory: &Path, name: &str) -> Option<u16> {
    u16::from_str_radix(&attribute(directory, name)?, 16).ok()
}

fn decimal_attribute<T: FromStr>(directory: &Path, name: &str) -> Option<T> {
    attribute(directory, name)?.parse().ok()
}

/// Reads the information of one sysfs device directory; None if it isn't a USB device.
pub(crate) fn device_information(directory: &Path) -> Option<DeviceInformation> {
    let bus_number: u8 = decimal_attribute(directory, "busnum")?;
    let device_address: u8 = decimal_attribute(directory, "devnum")?;

    Some(DeviceInformation {
        vendor_id: hex_attribute(directory, "idVendor")?,
        product_id: hex_attribute(directory, "idProduct")?,
        serial: attribute(directory, "serial"),
        manufacturer: attribute(directory, "manufacturer"),
        product: attribute(directory, "product"),
        bus_number: Some(bus_number),
        device_address: Some(device_address),
        backend_path: Some(format!("/dev/bus/usb/{bus_number:03}/{device_address:03}")),
        backend_numeric_location: None,
    })
}

/// Device directories; interface directories (like `1-2:1.0`) are skipped.
fn device_directories() -> UsbResult<Vec<PathBuf>> {
    let entries = fs::read_dir(SYSFS_USB_DEVICES).map_err(|error| {
        Error::SubsystemUnavailable(format!("cannot read {SYSFS_USB_DEVICES}: {error}"))
    })?;

    Ok(entries
        .flatten()
        .filter(|entry| !entry.file_name().to_string_lossy().contains(':'))
        .map(|entry| entry.path())
        .collect())
}

pub(crate) fn devices() -> UsbResult<Vec<DeviceInformation>> {
    let devices = device_directories()?
        .iter()
        .filter_map(|directory| {
            let information = device_information(directory);
            if information.is_none() {
                trace!("skipping {}; not a USB device", directory.display());
            }
            information
        })
        .collect();

    Ok(devices)
}

/// The bConfigurationValue of the device's active configuration, if sysfs knows it.
pub(crate) fn active_configuration(bus_number: u8, device_address: u8) -> Option<u8> {
    device_directories()
        .ok()?
        .into_iter()
        .find(|directory| {
            decimal_attribute(directory, "busnum") == Some(bus_number)
                && decimal_attribute(directory, "devnum") == Some(device_address)
        })
        .and_then(|directory| decimal_attribute(&directory, "bConfigurationValue"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_sysfs_attributes() {
        let directory = std::env::temp_dir().join(format!("usbdirect-sysfs-{}", std::process::id()));
        fs::create_dir_all(&directory).unwrap();
        for (name, value) in [
            ("busnum", "3\n"),
            ("devnum", "17\n"),
            ("idVendor", "1209\n"),
            ("idProduct", "000a\n"),
            ("product", "Loopback\n"),
        ] {
            fs::write(directory.join(name), value).unwrap();
        }

        let information = device_information(&directory).unwrap();
        fs::remove_dir_all(&directory).unwrap();

        assert_eq!(information.vendor_id, 0x1209);
        assert_eq!(information.product_id, 0x000a);
        assert_eq!(information.product.as_deref(), Some("Loopback"));
        assert_eq!(information.serial, None);
        assert_eq!(information.backend_path.as_deref(), Some("/dev/bus/usb/003/017"));
    }
}
