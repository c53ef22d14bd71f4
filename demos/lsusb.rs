//! Lists every USB device the backend can see.

use usbdirect::Host;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let host = Host::new()?;

    for device in host.all_devices()? {
        let location = match (device.bus_number, device.device_address) {
            (Some(bus), Some(address)) => format!("Bus {bus:03} Device {address:03}"),
            _ => device.backend_path.clone().unwrap_or_default(),
        };

        println!(
            "{location}: ID {:04x}:{:04x} {} {}",
            device.vendor_id,
            device.product_id,
            device.manufacturer.as_deref().unwrap_or("-"),
            device.product.as_deref().unwrap_or("-"),
        );
        if let Some(serial) = &device.serial {
            println!("    serial: {serial}");
        }
    }

    Ok(())
}
