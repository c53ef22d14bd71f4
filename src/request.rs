//! Tools for describing USB requests: directions, request types, and control setup packets.

/// Size of the setup stage that precedes every control transfer.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Which way a transfer's data stage flows, seen from the host.
#[repr(u8)]
#[derive(Copy, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    /// Extracts the direction from an endpoint address (or a bmRequestType byte).
    pub const fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Combines this direction with an endpoint number into an endpoint address.
    pub const fn endpoint_address(self, number: u8) -> u8 {
        match self {
            Direction::In => number | 0x80,
            Direction::Out => number & 0x7f,
        }
    }

    /// Upper-case name, as used in error messages.
    pub(crate) fn name(self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

/// Bits 5 and 6 of bmRequestType.
#[repr(u8)]
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// The low bits of bmRequestType: what part of the device a request addresses.
#[repr(u8)]
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Everything about a control transfer except its direction and data stage.
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: Type,
    pub recipient: Recipient,

    /// The bRequest field; e.g. [StandardDeviceRequest::GetDescriptor].
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    /// Convenience constructor for standard requests to the whole device.
    pub fn standard(request: StandardDeviceRequest, value: u16, index: u16) -> Self {
        ControlRequest {
            request_type: Type::Standard,
            recipient: Recipient::Device,
            request: request.into(),
            value,
            index,
        }
    }

    /// Convenience constructor for vendor requests to the whole device.
    pub fn vendor(request: u8, value: u16, index: u16) -> Self {
        ControlRequest {
            request_type: Type::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    /// Returns the bmRequestType byte for this request, sent in the given direction.
    pub fn request_type_byte(&self, direction: Direction) -> u8 {
        ((direction as u8) << 7) | ((self.request_type as u8) << 5) | self.recipient as u8
    }

    /// Encodes the eight-byte setup packet, little-endian, as it appears on the wire.
    pub fn setup_packet(&self, direction: Direction, length: u16) -> [u8; SETUP_PACKET_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = length.to_le_bytes();

        [
            self.request_type_byte(direction),
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// bRequest values of the standard requests every device answers.
#[repr(u8)]
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum StandardDeviceRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
}

impl From<StandardDeviceRequest> for u8 {
    fn from(request: StandardDeviceRequest) -> u8 {
        request as u8
    }
}

/// Descriptor types, as requested in the high byte of a GET_DESCRIPTOR wValue.
#[repr(u8)]
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    InterfaceAssociation = 11,
}

impl From<DescriptorType> for u8 {
    fn from(descriptor: DescriptorType) -> u8 {
        descriptor as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_encoding() {
        let get_status = ControlRequest::standard(StandardDeviceRequest::GetStatus, 0, 0);
        assert_eq!(get_status.request_type_byte(Direction::In), 0x80);

        let vendor = ControlRequest::vendor(0x42, 0, 0);
        assert_eq!(vendor.request_type_byte(Direction::Out), 0x40);

        let class_to_interface = ControlRequest {
            request_type: Type::Class,
            recipient: Recipient::Interface,
            ..vendor
        };
        assert_eq!(class_to_interface.request_type_byte(Direction::In), 0xa1);
    }

    #[test]
    fn get_descriptor_setup_packet() {
        let request = ControlRequest::standard(
            StandardDeviceRequest::GetDescriptor,
            (DescriptorType::Device as u16) << 8,
            0,
        );

        assert_eq!(
            request.setup_packet(Direction::In, 18),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn endpoint_addresses() {
        assert_eq!(Direction::In.endpoint_address(1), 0x81);
        assert_eq!(Direction::Out.endpoint_address(2), 0x02);
        assert_eq!(Direction::from_address(0x83), Direction::In);
    }
}
