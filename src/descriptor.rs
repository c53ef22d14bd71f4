//! Types for working with and parsing USB descriptors.

use std::io::Cursor;

use binrw::{binrw, BinRead};

use crate::error::{Error, UsbResult};
use crate::request::{DescriptorType, Direction};

#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[allow(non_snake_case)]
#[binrw]
// USB is little-endian [USB 2.0§8.1]
#[brw(little)]
pub struct DeviceDescriptor {
    pub bLength: u8,
    /// Constant: 1.
    pub bDescriptorType: u8,
    pub bcdUSB: u16,
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: u16,
    pub idProduct: u16,
    pub bcdDevice: u16,
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

/// Length of a device descriptor.
pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;

#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[allow(non_snake_case)]
#[binrw]
#[brw(little)]
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    /// Constant: 2.
    pub bDescriptorType: u8,
    pub wTotalLength: u16,
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

/// Length of the header of a configuration descriptor.
pub const CONFIGURATION_HEADER_SIZE: usize = 9;

#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[allow(non_snake_case)]
#[binrw]
#[brw(little)]
pub struct InterfaceDescriptor {
    pub bLength: u8,
    /// Constant: 4.
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[allow(non_snake_case)]
#[binrw]
#[brw(little)]
pub struct EndpointDescriptor {
    pub bLength: u8,
    /// Constant: 5.
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: u16,
    pub bInterval: u8,
}

#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[allow(non_snake_case)]
#[binrw]
#[brw(little)]
pub struct InterfaceAssociationDescriptor {
    pub bLength: u8,
    /// Constant: 11.
    pub bDescriptorType: u8,
    pub bFirstInterface: u8,
    pub bInterfaceCount: u8,
    pub bFunctionClass: u8,
    pub bFunctionSubClass: u8,
    pub bFunctionProtocol: u8,
    pub iFunction: u8,
}

/// The kind of transfers an endpoint performs.
#[repr(u8)]
#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Extracts the transfer type from an endpoint's bmAttributes.
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            TransferType::Control => "control",
            TransferType::Isochronous => "isochronous",
            TransferType::Bulk => "bulk",
            TransferType::Interrupt => "interrupt",
        }
    }
}

/// An endpoint, as described by one alternate setting of an interface.
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,

    /// Maximum packet size, without the high-bandwidth multiplier bits.
    pub max_packet_size: u16,
    pub interval: u8,
}

impl Endpoint {
    pub fn address(&self) -> u8 {
        self.direction.endpoint_address(self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateSetting {
    pub number: u8,
    pub class_code: u8,
    pub subclass_code: u8,
    pub protocol_code: u8,
    pub endpoints: Vec<Endpoint>,
}

/// An interface with all of its alternate settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub number: u8,
    pub alternates: Vec<AlternateSetting>,
}

impl Interface {
    pub fn alternate(&self, number: u8) -> Option<&AlternateSetting> {
        self.alternates.iter().find(|alternate| alternate.number == number)
    }
}

/// Groups consecutive interfaces into a single function of a composite device.
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAssociation {
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
}

/// A parsed configuration descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub value: u8,
    pub attributes: u8,

    /// Maximum power draw, in units of 2 mA.
    pub max_power: u8,
    pub interfaces: Vec<Interface>,
    pub associations: Vec<InterfaceAssociation>,
}

impl Configuration {
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|interface| interface.number == number)
    }
}

/// Reads a fixed-layout descriptor from the start of a byte slice.
macro_rules! read_descriptor {
    ($kind:ty, $bytes:expr, $what:expr) => {
        <$kind>::read(&mut Cursor::new($bytes))
            .map_err(|error| Error::InvalidDescriptor(format!("{}: {error}", $what)))
    };
}

/// Parses an 18-byte device descriptor.
pub fn parse_device_descriptor(bytes: &[u8]) -> UsbResult<DeviceDescriptor> {
    if bytes.len() < DEVICE_DESCRIPTOR_SIZE {
        return Err(Error::InvalidDescriptor(format!(
            "device descriptor is {} bytes long; expected {DEVICE_DESCRIPTOR_SIZE}",
            bytes.len()
        )));
    }

    let descriptor = read_descriptor!(DeviceDescriptor, bytes, "device descriptor")?;
    if descriptor.bDescriptorType != DescriptorType::Device as u8 {
        return Err(Error::InvalidDescriptor(format!(
            "expected a device descriptor, found type {}",
            descriptor.bDescriptorType
        )));
    }

    Ok(descriptor)
}

/// Parses a full configuration descriptor: the header, plus every interface, endpoint and
/// interface association descriptor that follows it. Descriptors of other types are skipped.
pub fn parse_configuration(bytes: &[u8]) -> UsbResult<Configuration> {
    if bytes.len() < CONFIGURATION_HEADER_SIZE {
        return Err(Error::InvalidDescriptor(
            "configuration descriptor is truncated".into(),
        ));
    }

    let header = read_descriptor!(ConfigurationDescriptor, bytes, "configuration descriptor")?;
    if header.bDescriptorType != DescriptorType::Configuration as u8 {
        return Err(Error::InvalidDescriptor(format!(
            "expected a configuration descriptor, found type {}",
            header.bDescriptorType
        )));
    }

    let total_length = (header.wTotalLength as usize).min(bytes.len());
    let mut configuration = Configuration {
        value: header.bConfigurationValue,
        attributes: header.bmAttributes,
        max_power: header.bMaxPower,
        interfaces: vec![],
        associations: vec![],
    };

    // Tracks the (interface, alternate) pair that endpoint descriptors currently belong to.
    let mut current: Option<(usize, usize)> = None;

    let mut offset = header.bLength as usize;
    while offset + 2 <= total_length {
        let length = bytes[offset] as usize;
        let descriptor_type = bytes[offset + 1];

        if length < 2 || offset + length > total_length {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor at offset {offset} has invalid length {length}"
            )));
        }
        let body = &bytes[offset..offset + length];

        match descriptor_type {
            t if t == DescriptorType::Interface as u8 => {
                let descriptor = read_descriptor!(InterfaceDescriptor, body, "interface descriptor")?;
                let alternate = AlternateSetting {
                    number: descriptor.bAlternateSetting,
                    class_code: descriptor.bInterfaceClass,
                    subclass_code: descriptor.bInterfaceSubClass,
                    protocol_code: descriptor.bInterfaceProtocol,
                    endpoints: vec![],
                };

                let interfaces = &mut configuration.interfaces;
                let index = match interfaces
                    .iter()
                    .position(|interface| interface.number == descriptor.bInterfaceNumber)
                {
                    Some(index) => index,
                    None => {
                        interfaces.push(Interface {
                            number: descriptor.bInterfaceNumber,
                            alternates: vec![],
                        });
                        interfaces.len() - 1
                    }
                };

                interfaces[index].alternates.push(alternate);
                current = Some((index, interfaces[index].alternates.len() - 1));
            }

            t if t == DescriptorType::Endpoint as u8 => {
                let descriptor = read_descriptor!(EndpointDescriptor, body, "endpoint descriptor")?;
                let Some((interface, alternate)) = current else {
                    return Err(Error::InvalidDescriptor(
                        "endpoint descriptor precedes any interface descriptor".into(),
                    ));
                };

                configuration.interfaces[interface].alternates[alternate]
                    .endpoints
                    .push(Endpoint {
                        number: descriptor.bEndpointAddress & 0x7f,
                        direction: Direction::from_address(descriptor.bEndpointAddress),
                        transfer_type: TransferType::from_attributes(descriptor.bmAttributes),
                        max_packet_size: descriptor.wMaxPacketSize & 0x07ff,
                        interval: descriptor.bInterval,
                    });
            }

            t if t == DescriptorType::InterfaceAssociation as u8 => {
                let descriptor = read_descriptor!(
                    InterfaceAssociationDescriptor,
                    body,
                    "interface association descriptor"
                )?;
                configuration.associations.push(InterfaceAssociation {
                    first_interface: descriptor.bFirstInterface,
                    interface_count: descriptor.bInterfaceCount,
                    function_class: descriptor.bFunctionClass,
                    function_subclass: descriptor.bFunctionSubClass,
                    function_protocol: descriptor.bFunctionProtocol,
                });
            }

            // Class-specific and vendor descriptors aren't our business.
            _ => {}
        }

        offset += length;
    }

    Ok(configuration)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Device descriptor for a vendor-specific full-speed device.
    pub(crate) fn sample_device_descriptor() -> Vec<u8> {
        vec![
            18, 1, 0x00, 0x02, 0xff, 0x00, 0x00, 64, 0x09, 0x12, 0x01, 0x00, 0x00, 0x01, 1, 2, 3, 1,
        ]
    }

    /// Two interfaces; interface 0 has bulk 0x81 / 0x02 plus interrupt 0x83;
    /// interface 1 has an empty alternate 0 and a bulk 0x84 in alternate 1.
    pub(crate) fn sample_configuration() -> Vec<u8> {
        let mut body: Vec<u8> = vec![];
        body.extend([8, 11, 0, 2, 0xff, 0x00, 0x00, 0]);
        body.extend([9, 4, 0, 0, 3, 0xff, 0x00, 0x00, 0]);
        body.extend([7, 5, 0x81, 0x02, 64, 0, 0]);
        body.extend([7, 5, 0x02, 0x02, 64, 0, 0]);
        body.extend([7, 5, 0x83, 0x03, 16, 0, 10]);
        body.extend([9, 4, 1, 0, 0, 0xff, 0x00, 0x00, 0]);
        body.extend([9, 4, 1, 1, 1, 0xff, 0x00, 0x00, 0]);
        body.extend([5, 0x24, 0x00, 0x10, 0x01]);
        body.extend([7, 5, 0x84, 0x02, 64, 0, 0]);

        let total = (CONFIGURATION_HEADER_SIZE + body.len()) as u16;
        let mut descriptor = vec![9, 2, total as u8, (total >> 8) as u8, 2, 1, 0, 0x80, 50];
        descriptor.extend(body);
        descriptor
    }

    #[test]
    fn parses_device_descriptor() {
        let descriptor = parse_device_descriptor(&sample_device_descriptor()).unwrap();
        assert_eq!(descriptor.idVendor, 0x1209);
        assert_eq!(descriptor.idProduct, 0x0001);
        assert_eq!(descriptor.bMaxPacketSize0, 64);
        assert_eq!(descriptor.bNumConfigurations, 1);
    }

    #[test]
    fn rejects_short_device_descriptor() {
        let result = parse_device_descriptor(&[18, 1, 0, 2]);
        assert!(matches!(result, Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn parses_configuration_tree() {
        let configuration = parse_configuration(&sample_configuration()).unwrap();
        assert_eq!(configuration.value, 1);
        assert_eq!(configuration.interfaces.len(), 2);
        assert_eq!(configuration.associations.len(), 1);
        assert_eq!(configuration.associations[0].interface_count, 2);

        let first = &configuration.interfaces[0].alternates[0];
        assert_eq!(first.endpoints.len(), 3);
        assert_eq!(first.endpoints[0].address(), 0x81);
        assert_eq!(first.endpoints[0].transfer_type, TransferType::Bulk);
        assert_eq!(first.endpoints[1].direction, Direction::Out);
        assert_eq!(first.endpoints[2].transfer_type, TransferType::Interrupt);
        assert_eq!(first.endpoints[2].max_packet_size, 16);

        // The class-specific descriptor between alternate 1 and its endpoint is skipped.
        let second = configuration.interface(1).unwrap();
        assert_eq!(second.alternates.len(), 2);
        assert!(second.alternate(0).unwrap().endpoints.is_empty());
        assert_eq!(second.alternate(1).unwrap().endpoints[0].address(), 0x84);
    }

    #[test]
    fn rejects_overlong_nested_descriptor() {
        let mut descriptor = sample_configuration();
        descriptor[CONFIGURATION_HEADER_SIZE] = 200;
        assert!(matches!(
            parse_configuration(&descriptor),
            Err(Error::InvalidDescriptor(_))
        ));
    }
}
