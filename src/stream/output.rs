//! Pipelined writes to a bulk OUT endpoint.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;

use log::{debug, warn};

use crate::backend::EndpointInfo;
use crate::device::{check_result, DeviceInner};
use crate::error::{Error, UsbResult};
use crate::transfer::{Rejected, Transfer};

const CLOSED: &str = "Bulk endpoint output stream has been closed";

/// Number of packet-sized transfers an output stream cycles through.
const POOL_SIZE: usize = 4;

/// Buffered writer for a bulk OUT endpoint.
///
/// Data is sent in packet-sized transfers as soon as a packet fills up; [io::Write::flush] sends
/// the partial packet, terminates the transmission with a zero-length packet if the last packet
/// was full, and waits until the device has accepted everything.
///
/// A failed transfer closes the stream; every later operation reports it as closed.
pub struct EndpointWriter {
    /// None once the stream is closed.
    device: Option<Arc<DeviceInner>>,
    endpoint: EndpointInfo,
    packet_size: usize,

    completions: SyncSender<Transfer>,
    completed: Receiver<Transfer>,

    /// Transfers that have never been submitted, or have come back through `completed`.
    spare: Vec<Transfer>,

    /// Transfers submitted and not yet taken back out of `completed`.
    outstanding: usize,

    /// How many of the `outstanding` transfers are already sitting in `completed`.
    queued: Arc<AtomicUsize>,

    /// The transfer being filled; None only while the stream is switching transfers.
    current: Option<Transfer>,
    write_offset: usize,

    /// Set when the last submitted transfer was exactly one packet long.
    needs_zlp: bool,
}

impl EndpointWriter {
    pub(crate) fn new(
        device: Arc<DeviceInner>,
        endpoint: EndpointInfo,
        buffer_size_hint: usize,
    ) -> UsbResult<Self> {
        let packet_size = super::packet_size(&endpoint)?;
        debug!(
            "opening output stream on endpoint {:#04x}: {POOL_SIZE} transfers of {packet_size} bytes \
             (buffer size hint of {buffer_size_hint} not used)",
            endpoint.address()
        );

        let (completions, completed) = mpsc::sync_channel(POOL_SIZE);
        let spare = (1..POOL_SIZE)
            .map(|_| Transfer::with_length(packet_size))
            .collect();

        Ok(EndpointWriter {
            device: Some(device),
            endpoint,
            packet_size,
            completions,
            completed,
            spare,
            outstanding: 0,
            queued: Arc::new(AtomicUsize::new(0)),
            current: Some(Transfer::with_length(packet_size)),
            write_offset: 0,
            needs_zlp: false,
        })
    }

    /// Sends any buffered data, waits for everything to be accepted, and closes the stream.
    /// Closing a closed stream does nothing.
    pub fn close(&mut self) -> UsbResult<()> {
        if self.device.is_none() {
            return Ok(());
        }

        let result = self.flush_all();
        self.shut_down();
        result
    }

    fn closed_error() -> Error {
        Error::Closed(CLOSED.into())
    }

    /// Waits for every outstanding transfer, ignoring their outcome, and forgets the device.
    fn shut_down(&mut self) {
        while self.outstanding > 0 {
            match self.completed.recv() {
                Ok(transfer) => {
                    self.take_from_queue();
                    self.spare.push(transfer);
                }
                Err(_) => break,
            }
        }
        self.device = None;
    }

    /// Latches a transfer error: the stream is closed from here on.
    fn fail(&mut self, error: Error) -> Error {
        debug!("output stream failed; closing it: {error}");
        self.shut_down();
        error
    }

    fn take_from_queue(&mut self) {
        self.outstanding -= 1;
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// Waits for one submitted transfer to come back, and checks how it went.
    fn collect_one(&mut self) -> UsbResult<Transfer> {
        let transfer = self
            .completed
            .recv()
            .map_err(|_| Error::Internal("output stream lost track of its transfers".into()))?;
        self.take_from_queue();

        let Some(device) = self.device.as_ref() else {
            self.spare.push(transfer);
            return Err(Self::closed_error());
        };

        match check_result(device.translator(), transfer, &self.endpoint.describe()) {
            Ok(transfer) => Ok(transfer),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Gets an empty, packet-sized transfer; waits for one to come back if none is spare.
    fn next_transfer(&mut self) -> UsbResult<Transfer> {
        let mut transfer = match self.spare.pop() {
            Some(transfer) => transfer,
            None => self.collect_one()?,
        };
        transfer.set_requested_length(self.packet_size);
        Ok(transfer)
    }

    /// Submits the first `length` bytes of the current transfer, and moves on to a fresh one.
    fn submit_current(&mut self, length: usize) -> UsbResult<()> {
        let Some(device) = self.device.as_ref() else {
            return Err(Self::closed_error());
        };
        let Some(mut transfer) = self.current.take() else {
            return Err(Self::closed_error());
        };

        transfer.set_requested_length(length);
        let completions = self.completions.clone();
        let queued = Arc::clone(&self.queued);
        transfer.set_completion(move |transfer| {
            queued.fetch_add(1, Ordering::SeqCst);
            // The channel holds the whole pool; this never blocks.
            let _ = completions.send(transfer);
        });

        if let Err(Rejected { error, transfer }) = device.submit(&self.endpoint, transfer, None) {
            self.current = Some(transfer);
            return Err(self.fail(error));
        }

        self.outstanding += 1;
        self.needs_zlp = length == self.packet_size;
        self.write_offset = 0;

        let next = self.next_transfer()?;
        self.current = Some(next);
        Ok(())
    }

    fn write_bytes(&mut self, mut data: &[u8]) -> UsbResult<()> {
        if self.device.is_none() {
            return Err(Self::closed_error());
        }

        while !data.is_empty() {
            let Some(current) = self.current.as_mut() else {
                return Err(Self::closed_error());
            };

            let length = data.len().min(self.packet_size - self.write_offset);
            current.data_mut()[self.write_offset..self.write_offset + length]
                .copy_from_slice(&data[..length]);
            self.write_offset += length;
            data = &data[length..];

            if self.write_offset == self.packet_size {
                self.submit_current(self.packet_size)?;
            }
        }

        Ok(())
    }

    fn flush_all(&mut self) -> UsbResult<()> {
        if self.device.is_none() {
            return Err(Self::closed_error());
        }

        if self.write_offset > 0 {
            self.submit_current(self.write_offset)?;
        }
        if self.needs_zlp {
            self.submit_current(0)?;
        }

        while self.outstanding > 0 {
            let transfer = self.collect_one()?;
            self.spare.push(transfer);
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool_state(&self) -> super::PoolState {
        let queued = self.queued.load(Ordering::SeqCst);
        super::PoolState {
            in_flight: self.outstanding - queued,
            queued: queued + self.spare.len(),
            current: usize::from(self.current.is_some()),
            total: POOL_SIZE,
        }
    }
}

impl io::Write for EndpointWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_all()?)
    }
}

impl Drop for EndpointWriter {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("failed to close output stream: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::thread;

    use super::*;
    use crate::backend::mock::{self, MockHandle};
    use crate::device::Device;

    fn open_claimed() -> (Device, MockHandle) {
        let (device, handle) = mock::open_mock_device();
        device.claim_interface(0).unwrap();
        (device, handle)
    }

    fn written_lengths(handle: &MockHandle) -> Vec<usize> {
        handle
            .hardware()
            .written
            .iter()
            .filter(|(address, _)| *address == 0x02)
            .map(|(_, data)| data.len())
            .collect()
    }

    #[test]
    fn full_packet_is_terminated_by_zlp() {
        let (device, handle) = open_claimed();
        let mut writer = device.open_output_stream(2, 0).unwrap();

        writer.write_all(&[0x55; 64]).unwrap();
        writer.flush().unwrap();

        assert_eq!(written_lengths(&handle), vec![64, 0]);
    }

    #[test]
    fn short_packet_needs_no_zlp() {
        let (device, handle) = open_claimed();
        let mut writer = device.open_output_stream(2, 0).unwrap();

        writer.write_all(&[1; 150]).unwrap();
        writer.flush().unwrap();

        assert_eq!(written_lengths(&handle), vec![64, 64, 22]);
        assert_eq!(handle.hardware().written[2].1, vec![1; 22]);
    }

    #[test]
    fn flush_without_data_sends_nothing() {
        let (device, handle) = open_claimed();
        let mut writer = device.open_output_stream(2, 0).unwrap();
        writer.flush().unwrap();
        writer.close().unwrap();

        assert!(written_lengths(&handle).is_empty());
    }

    #[test]
    fn close_flushes() {
        let (device, handle) = open_claimed();
        let mut writer = device.open_output_stream(2, 0).unwrap();
        writer.write_all(b"bye").unwrap();
        drop(writer);

        assert_eq!(handle.hardware().written, vec![(0x02, b"bye".to_vec())]);
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn failure_latches_closed() {
        let (device, handle) = open_claimed();
        let mut writer = device.open_output_stream(2, 0).unwrap();
        handle.fail_next_out(mock::STALL);

        writer.write_all(&[0; 10]).unwrap();
        let error = writer.flush().unwrap_err();
        let error = error.into_inner().unwrap().downcast::<Error>().unwrap();
        assert!(error.is_stall(), "{error:?}");

        let error = writer.write(&[0; 10]).unwrap_err();
        let error = error.into_inner().unwrap().downcast::<Error>().unwrap();
        assert_eq!(*error, Error::Closed(CLOSED.into()));

        // Closing a failed stream succeeds without sending anything more.
        writer.close().unwrap();
        assert_eq!(written_lengths(&handle), vec![10]);
    }

    #[test]
    fn buffers_are_conserved_while_the_device_is_slow() {
        let (device, handle) = open_claimed();
        handle.hold_out(true);
        let mut writer = device.open_output_stream(2, 0).unwrap();

        writer.write_all(&[7; 64 * 3]).unwrap();
        let state = writer.pool_state();
        assert_eq!(state.in_flight, 3);
        assert!(state.is_conserved(), "{state:?}");

        // A fourth packet has to wait for the device to accept one.
        let releaser = {
            let handle = handle.clone();
            thread::spawn(move || {
                handle.wait_for(|hardware| hardware.waiting_on(0x02) == 4);
                for _ in 0..4 {
                    assert!(handle.release_out(0x02));
                }
            })
        };

        writer.write_all(&[7; 64]).unwrap();
        let state = writer.pool_state();
        assert!(state.is_conserved(), "{state:?}");

        handle.hold_out(false);
        writer.flush().unwrap();
        releaser.join().unwrap();

        let state = writer.pool_state();
        assert_eq!(state.in_flight, 0);
        assert!(state.is_conserved(), "{state:?}");
        assert_eq!(written_lengths(&handle), vec![64, 64, 64, 64, 0]);
    }
}
