//! Opens a device by VID:PID and prints its descriptors.
//!
//! Usage: `descriptor <vid> <pid>`, both in hex.

use std::env;

use usbdirect::descriptor::{parse_device_descriptor, TransferType};
use usbdirect::{device, open, DeviceSelector};

fn parse_id(argument: Option<String>) -> Result<u16, Box<dyn std::error::Error>> {
    let argument = argument.ok_or("usage: descriptor <vid> <pid>")?;
    Ok(u16::from_str_radix(argument.trim_start_matches("0x"), 16)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut arguments = env::args().skip(1);
    let vendor_id = parse_id(arguments.next())?;
    let product_id = parse_id(arguments.next())?;

    // Find the device we're interested in...
    let information = device(&DeviceSelector {
        vendor_id: Some(vendor_id),
        product_id: Some(product_id),
        ..Default::default()
    })?;

    // ... open it ...
    let device = open(&information)?;

    // ... and walk its descriptors.
    let descriptor = parse_device_descriptor(device.device_descriptor())?;
    println!(
        "device {:04x}:{:04x}, USB {:x}.{:02x}, {} configuration(s)",
        descriptor.idVendor,
        descriptor.idProduct,
        descriptor.bcdUSB >> 8,
        descriptor.bcdUSB & 0xff,
        descriptor.bNumConfigurations
    );

    for (label, index) in [
        ("manufacturer", descriptor.iManufacturer),
        ("product", descriptor.iProduct),
        ("serial", descriptor.iSerialNumber),
    ] {
        if index != 0 {
            match device.read_string_descriptor(index) {
                Ok(string) => println!("  {label}: {string}"),
                Err(error) => println!("  {label}: <{error}>"),
            }
        }
    }

    let configuration = device.configuration();
    println!("configuration {}:", configuration.value);
    for interface in &configuration.interfaces {
        for alternate in &interface.alternates {
            println!(
                "  interface {} alt {}: class {:02x}/{:02x}/{:02x}",
                interface.number,
                alternate.number,
                alternate.class_code,
                alternate.subclass_code,
                alternate.protocol_code
            );

            for endpoint in &alternate.endpoints {
                let kind = match endpoint.transfer_type {
                    TransferType::Control => "control",
                    TransferType::Isochronous => "isochronous",
                    TransferType::Bulk => "bulk",
                    TransferType::Interrupt => "interrupt",
                };
                println!(
                    "    endpoint {:#04x}: {kind}, {} bytes per packet",
                    endpoint.address(),
                    endpoint.max_packet_size
                );
            }
        }
    }

    Ok(())
}
