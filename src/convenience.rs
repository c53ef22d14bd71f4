//! Convenience functions to make working with the library easier.

use std::time::Duration;

use crate::device::Device;
use crate::error::{Error, UsbResult};
use crate::request::{ControlRequest, DescriptorType, StandardDeviceRequest};

/// Language ID used for string descriptors: US English.
pub const DEFAULT_LANGUAGE_ID: u16 = 0x0409;

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

impl Device {
    /// Reads a standard descriptor straight from the device, using a GET_DESCRIPTOR request.
    pub fn read_standard_descriptor(&self, descriptor: DescriptorType, index: u8) -> UsbResult<Vec<u8>> {
        let length = match descriptor {
            DescriptorType::Device => 18,
            _ => 255,
        };

        let request = ControlRequest::standard(
            StandardDeviceRequest::GetDescriptor,
            ((descriptor as u16) << 8) | index as u16,
            0,
        );
        self.control_transfer_in(&request, length, Some(DESCRIPTOR_TIMEOUT))
    }

    /// Reads a string descriptor in US English, and decodes it.
    pub fn read_string_descriptor(&self, index: u8) -> UsbResult<String> {
        if index == 0 {
            return Err(Error::InvalidArgument(
                "string descriptor 0 holds language IDs, not a string".into(),
            ));
        }

        let request = ControlRequest::standard(
            StandardDeviceRequest::GetDescriptor,
            ((DescriptorType::String as u16) << 8) | index as u16,
            DEFAULT_LANGUAGE_ID,
        );
        let raw = self.control_transfer_in(&request, 255, Some(DESCRIPTOR_TIMEOUT))?;
        decode_string_descriptor(&raw)
    }
}

/// Decodes the UTF-16LE payload of a raw string descriptor.
pub fn decode_string_descriptor(raw: &[u8]) -> UsbResult<String> {
    let valid = raw.len() >= 2
        && raw[1] == DescriptorType::String as u8
        && (raw[0] as usize) <= raw.len()
        && raw[0] >= 2;
    if !valid {
        return Err(Error::InvalidDescriptor(format!(
            "malformed string descriptor of {} bytes",
            raw.len()
        )));
    }

    let units: Vec<u16> = raw[2..raw[0] as usize]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}
