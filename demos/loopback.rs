//! Exercises a bulk loopback device: whatever is sent to endpoint 1 OUT comes back on
//! endpoint 2 IN.
//!
//! Sends one packet synchronously, one asynchronously, and then streams a larger payload
//! through the buffered endpoint streams.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use usbdirect::{device, open, DeviceSelector};

const VENDOR_ID: u16 = 0xcafe;
const PRODUCT_ID: u16 = 0xceaf;
const INTERFACE: u8 = 0;
const ENDPOINT_OUT: u8 = 1;
const ENDPOINT_IN: u8 = 2;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(1));
const STREAM_LENGTH: usize = 100_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let information = device(&DeviceSelector {
        vendor_id: Some(VENDOR_ID),
        product_id: Some(PRODUCT_ID),
        ..Default::default()
    })?;
    let device = open(&information)?;
    device.claim_interface(INTERFACE)?;

    // One packet, synchronously.
    device.transfer_out(ENDPOINT_OUT, b"Hello!", TIMEOUT)?;
    let echoed = device.transfer_in(ENDPOINT_IN, TIMEOUT)?;
    println!("synchronous: sent 6 bytes, received {}", echoed.len());

    // One packet, asynchronously.
    let (sent, received) = smol::block_on(async {
        let sent = device.transfer_out_async(ENDPOINT_OUT, b"Hello again!".to_vec()).await?;
        let received = device.transfer_in_async(ENDPOINT_IN, 64).await?;
        Ok::<_, usbdirect::Error>((sent, received))
    })?;
    println!("asynchronous: sent {sent} bytes, received {}", received.len());

    // A larger payload, through the streams; written and read concurrently so neither side
    // stalls the device.
    let payload: Vec<u8> = (0..STREAM_LENGTH).map(|index| (index % 251) as u8).collect();
    let mut writer = device.open_output_stream(ENDPOINT_OUT, 0)?;
    let mut reader = device.open_input_stream(ENDPOINT_IN, 0)?;

    let received = thread::scope(|scope| {
        let sender = scope.spawn(|| -> std::io::Result<()> {
            writer.write_all(&payload)?;
            writer.flush()
        });

        let mut received = vec![0u8; STREAM_LENGTH];
        let result = reader.read_exact(&mut received).map(|_| received);
        sender.join().expect("writer thread panicked")?;
        result
    })?;

    writer.close()?;
    reader.close()?;
    println!(
        "streamed {} bytes; contents {}",
        received.len(),
        if received == payload { "match" } else { "differ" }
    );

    device.release_interface(INTERFACE)?;
    Ok(())
}
