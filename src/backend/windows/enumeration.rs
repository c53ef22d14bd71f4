//! Device enumeration through SetupAPI.

use std::mem;
use std::ptr;

use log::{debug, trace};
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW,
    SetupDiGetDeviceInterfaceDetailW, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO,
    SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W,
};
use windows_sys::Win32::Devices::Usb::GUID_DEVINTERFACE_USB_DEVICE;
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_INSUFFICIENT_BUFFER, ERROR_NO_MORE_ITEMS, FALSE, INVALID_HANDLE_VALUE,
};

use super::last_error;
use crate::device::DeviceInformation;
use crate::error::UsbResult;

/// The set of present devices exposing the USB device interface class.
struct DeviceInfoSet(HDEVINFO);

impl DeviceInfoSet {
    fn present_usb_devices() -> UsbResult<Self> {
        let set = unsafe {
            SetupDiGetClassDevsW(
                &GUID_DEVINTERFACE_USB_DEVICE,
                ptr::null(),
                ptr::null_mut(),
                DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
            )
        };
        if set == INVALID_HANDLE_VALUE as HDEVINFO {
            return Err(last_error("listing USB devices"));
        }
        Ok(DeviceInfoSet(set))
    }

    /// Returns the device interface at `index`, or None past the end of the set.
    fn interface(&self, index: u32) -> UsbResult<Option<SP_DEVICE_INTERFACE_DATA>> {
        let mut interface: SP_DEVICE_INTERFACE_DATA = unsafe { mem::zeroed() };
        interface.cbSize = mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;

        let found = unsafe {
            SetupDiEnumDeviceInterfaces(
                self.0,
                ptr::null(),
                &GUID_DEVINTERFACE_USB_DEVICE,
                index,
                &mut interface,
            )
        };
        if found == FALSE {
            return match unsafe { GetLastError() } {
                ERROR_NO_MORE_ITEMS => Ok(None),
                _ => Err(last_error("enumerating USB device interfaces")),
            };
        }
        Ok(Some(interface))
    }

    /// Returns the path CreateFileW accepts for a device interface.
    fn path(&self, interface: &SP_DEVICE_INTERFACE_DATA) -> UsbResult<String> {
        let mut required: u32 = 0;
        let sized = unsafe {
            SetupDiGetDeviceInterfaceDetailW(
                self.0,
                interface,
                ptr::null_mut(),
                0,
                &mut required,
                ptr::null_mut(),
            )
        };
        if sized == FALSE && unsafe { GetLastError() } != ERROR_INSUFFICIENT_BUFFER {
            return Err(last_error("sizing device interface detail"));
        }

        // Backed by u32s so the detail structure is suitably aligned.
        let mut buffer = vec![0u32; (required as usize).div_ceil(4).max(2)];
        let detail = buffer.as_mut_ptr().cast::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>();

        let read = unsafe {
            (*detail).cbSize = mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
            SetupDiGetDeviceInterfaceDetailW(
                self.0,
                interface,
                detail,
                required,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if read == FALSE {
            return Err(last_error("reading device interface detail"));
        }

        let path = unsafe { ptr::addr_of!((*detail).DevicePath).cast::<u16>() };
        let offset = path as usize - detail as usize;
        let units = (required as usize).saturating_sub(offset) / 2;
        let wide = unsafe { std::slice::from_raw_parts(path, units) };
        let end = wide.iter().position(|unit| *unit == 0).unwrap_or(wide.len());

        Ok(String::from_utf16_lossy(&wide[..end]))
    }
}

impl Drop for DeviceInfoSet {
    fn drop(&mut self) {
        unsafe { SetupDiDestroyDeviceInfoList(self.0) };
    }
}

/// What a USB device interface path tells us about the device behind it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PathIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

/// Parses a path of the form `\\?\usb#vid_XXXX&pid_YYYY#<instance>#{class guid}`.
///
/// The instance segment is the serial number, unless Windows generated it itself; generated
/// instance ids always contain an ampersand.
pub(crate) fn parse_device_path(path: &str) -> Option<PathIdentity> {
    let mut segments = path.split('#');
    segments.next()?;
    let hardware_id = segments.next()?.to_ascii_lowercase();
    let instance = segments.next()?;

    let mut vendor_id = None;
    let mut product_id = None;
    for part in hardware_id.split('&') {
        if let Some(hex) = part.strip_prefix("vid_") {
            vendor_id = u16::from_str_radix(hex, 16).ok();
        } else if let Some(hex) = part.strip_prefix("pid_") {
            product_id = u16::from_str_radix(hex, 16).ok();
        }
    }

    let serial = match instance {
        "" => None,
        generated if generated.contains('&') => None,
        serial => Some(serial.to_string()),
    };

    Some(PathIdentity {
        vendor_id: vendor_id?,
        product_id: product_id?,
        serial,
    })
}

pub(crate) fn devices() -> UsbResult<Vec<DeviceInformation>> {
    let set = DeviceInfoSet::present_usb_devices()?;
    let mut devices = vec![];

    let mut index = 0;
    while let Some(interface) = set.interface(index)? {
        index += 1;

        let path = set.path(&interface)?;
        let Some(identity) = parse_device_path(&path) else {
            debug!("can't identify USB device at {path}; skipping it");
            continue;
        };
        trace!("found USB device {:04x}:{:04x} at {path}", identity.vendor_id, identity.product_id);

        devices.push(DeviceInformation {
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            serial: identity.serial,
            backend_path: Some(path),
            ..DeviceInformation::default()
        });
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_numbers_come_from_the_instance_segment() {
        let path = r"\\?\usb#vid_cafe&pid_4010#a7f3c912#{a5dcbf10-6530-11d2-901f-00c04fb951ed}";
        assert_eq!(
            parse_device_path(path),
            Some(PathIdentity {
                vendor_id: 0xcafe,
                product_id: 0x4010,
                serial: Some("a7f3c912".into()),
            })
        );
    }

    #[test]
    fn generated_instance_ids_are_not_serials() {
        let path = r"\\?\USB#VID_1D50&PID_6018#6&1a2b3c4d&0&2#{a5dcbf10-6530-11d2-901f-00c04fb951ed}";
        let identity = parse_device_path(path).unwrap();
        assert_eq!((identity.vendor_id, identity.product_id), (0x1d50, 0x6018));
        assert_eq!(identity.serial, None);
    }

    #[test]
    fn foreign_paths_are_skipped() {
        assert_eq!(parse_device_path(r"\\?\hid#something"), None);
        assert_eq!(parse_device_path(r"\\?\usb#root_hub30#4&1&0#{guid}"), None);
    }
}
