//! Pipelined reads from a bulk IN endpoint.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;

use log::{debug, warn};

use crate::backend::EndpointInfo;
use crate::device::{check_result, DeviceInner};
use crate::error::{Error, UsbResult};
use crate::transfer::{Rejected, Transfer};

const CLOSED: &str = "Bulk endpoint input stream has been closed";

/// Works out the shape of an input pipeline: the size of each transfer, and how many
/// transfers to keep around in total.
///
/// Transfers are a whole number of packets, about the square root of the hint's packet count,
/// and there are always at least three of them so one can be read while two are in flight.
pub(crate) fn input_pipeline(packet_size: usize, buffer_size_hint: usize) -> (usize, usize) {
    let packets_in_hint = buffer_size_hint as f64 / packet_size as f64;
    let packets_per_transfer = (packets_in_hint.sqrt().round() as usize).clamp(4, 32);
    let transfer_size = packets_per_transfer * packet_size;

    let transfers = (buffer_size_hint.saturating_add(transfer_size / 2) / transfer_size).max(3);
    (transfer_size, transfers)
}

/// Buffered reader for a bulk IN endpoint; keeps several transfers in flight at all times.
///
/// Zero-length packets are skipped. Any transfer error closes the stream; every read after
/// that fails.
pub struct EndpointReader {
    /// None once the stream is closed.
    device: Option<Arc<DeviceInner>>,
    endpoint: EndpointInfo,

    completions: SyncSender<Transfer>,
    completed: Receiver<Transfer>,

    /// Transfers handed to the OS and not yet taken back out of `completed`.
    submitted: usize,

    /// How many of the `submitted` transfers are already sitting in `completed`.
    queued: Arc<AtomicUsize>,

    /// The transfer being read from; None only while it's being resubmitted.
    current: Option<Transfer>,
    read_offset: usize,

    total: usize,
}

impl EndpointReader {
    pub(crate) fn new(
        device: Arc<DeviceInner>,
        endpoint: EndpointInfo,
        buffer_size_hint: usize,
    ) -> UsbResult<Self> {
        let packet_size = super::packet_size(&endpoint)?;
        let (transfer_size, total) = input_pipeline(packet_size, buffer_size_hint);
        debug!(
            "opening input stream on endpoint {:#04x}: {total} transfers of {transfer_size} bytes",
            endpoint.address()
        );

        let (completions, completed) = mpsc::sync_channel(total);
        let mut reader = EndpointReader {
            device: Some(device),
            endpoint,
            completions,
            completed,
            submitted: 0,
            queued: Arc::new(AtomicUsize::new(0)),
            current: None,
            read_offset: 0,
            total,
        };

        // The last transfer starts out as an empty "current" one, and is submitted on the
        // first read.
        for _ in 1..total {
            reader.submit(Transfer::with_length(transfer_size))?;
        }
        reader.current.get_or_insert_with(|| Transfer::with_length(transfer_size));

        Ok(reader)
    }

    /// Number of bytes that can be read without blocking.
    pub fn available(&self) -> usize {
        self.current
            .as_ref()
            .map_or(0, |transfer| transfer.data().len() - self.read_offset)
    }

    /// Closes the stream: aborts the transfers in flight and waits for all of them to come back.
    /// Closing a closed stream does nothing.
    pub fn close(&mut self) -> UsbResult<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        self.current = None;

        let mut result = Ok(());
        if self.submitted > 0 {
            match device.abort(&self.endpoint) {
                Ok(()) => {}
                // A closed device has already collected every completion.
                Err(Error::DeviceNotOpen) => {}
                Err(error) => {
                    warn!("could not abort input stream transfers; waiting for them anyway: {error}");
                    result = Err(error);
                }
            }
        }

        while self.submitted > 0 {
            if self.completed.recv().is_err() {
                break;
            }
            self.take_from_queue();
        }

        result
    }

    fn take_from_queue(&mut self) {
        self.submitted -= 1;
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    fn submit(&mut self, mut transfer: Transfer) -> UsbResult<()> {
        let Some(device) = self.device.as_ref() else {
            self.current = Some(transfer);
            return Err(Error::Closed(CLOSED.into()));
        };

        let completions = self.completions.clone();
        let queued = Arc::clone(&self.queued);
        transfer.set_completion(move |transfer| {
            queued.fetch_add(1, Ordering::SeqCst);
            // The channel holds the whole pool; this never blocks.
            let _ = completions.send(transfer);
        });

        match device.submit(&self.endpoint, transfer, None) {
            Ok(_) => {
                self.submitted += 1;
                Ok(())
            }
            Err(Rejected { error, transfer }) => {
                self.current = Some(transfer);
                self.read_offset = 0;
                Err(error)
            }
        }
    }

    /// Resubmits the drained current transfer, and waits until a transfer with data comes back.
    fn receive_more(&mut self) -> UsbResult<()> {
        loop {
            if let Some(drained) = self.current.take() {
                self.submit(drained)?;
            }

            let transfer = self.completed.recv().map_err(|_| {
                Error::Internal("input stream lost track of its transfers".into())
            })?;
            self.take_from_queue();
            self.read_offset = 0;

            let translate = match &self.device {
                Some(device) => device.translator(),
                None => return Err(Error::Closed(CLOSED.into())),
            };

            let checked = check_result(translate, transfer, &self.endpoint.describe());
            match checked {
                Ok(transfer) => {
                    let empty = transfer.data().is_empty();
                    self.current = Some(transfer);
                    if !empty {
                        return Ok(());
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> UsbResult<usize> {
        if self.device.is_none() {
            return Err(Error::Closed(CLOSED.into()));
        }

        if self.available() == 0 {
            if let Err(error) = self.receive_more() {
                debug!("input stream failed; closing it: {error}");
                if let Err(close_error) = self.close() {
                    warn!("could not close failed input stream: {close_error}");
                }
                return Err(error);
            }
        }

        let Some(current) = self.current.as_ref() else {
            return Err(Error::Closed(CLOSED.into()));
        };
        let data = &current.data()[self.read_offset..];
        let length = data.len().min(buf.len());
        buf[..length].copy_from_slice(&data[..length]);
        self.read_offset += length;

        Ok(length)
    }

    #[cfg(test)]
    pub(crate) fn pool_state(&self) -> super::PoolState {
        let queued = self.queued.load(Ordering::SeqCst);
        super::PoolState {
            in_flight: self.submitted - queued,
            queued,
            current: usize::from(self.current.is_some()),
            total: self.total,
        }
    }
}

impl io::Read for EndpointReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_bytes(buf).map_err(io::Error::from)
    }
}

impl Drop for EndpointReader {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("failed to close input stream: {error}");
        }
    }
}
