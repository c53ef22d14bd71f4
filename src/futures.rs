//! Future definitions; for async support.
//!
//! Futures here are completed by the engine thread, which wakes whichever executor polled them.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

use crate::backend::EndpointInfo;
use crate::descriptor::TransferType;
use crate::device::Device;
use crate::error::{Error, UsbResult};
use crate::request::{ControlRequest, Direction};
use crate::transfer::Transfer;

/// Shared state between a UsbFuture and the engine thread completing its transfer.
struct UsbFutureState<T> {
    /// The result of the USB transfer; None until it has completed.
    result: Option<UsbResult<T>>,

    /// Set once the result has been handed to the future's owner.
    taken: bool,

    /// If we've been poll()'d, this contains the waker object used to indicate completion.
    waker: Option<Waker>,
}

/// Asynchronous Future that waits on the result of a USB transfer.
pub struct UsbFuture<T> {
    state: Arc<Mutex<UsbFutureState<T>>>,
}

impl<T: Send + 'static> UsbFuture<T> {
    fn new() -> Self {
        UsbFuture {
            state: Arc::new(Mutex::new(UsbFutureState {
                result: None,
                taken: false,
                waker: None,
            })),
        }
    }

    /// A future that's complete from the start; used when submission itself fails.
    fn ready(result: UsbResult<T>) -> Self {
        let future = Self::new();
        future.completer()(result);
        future
    }

    /// Returns the callback that completes this future.
    fn completer(&self) -> impl FnOnce(UsbResult<T>) + Send + 'static {
        let state = Arc::clone(&self.state);

        move |result| {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.result = Some(result);

            // If we've already been poll()'d, notify the executor that we're done.
            if let Some(waker) = state.waker.take() {
                waker.wake()
            }
        }
    }
}

impl<T> Future for UsbFuture<T> {
    type Output = UsbResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match state.result.take() {
            Some(result) => {
                state.taken = true;
                Poll::Ready(result)
            }
            None if state.taken => Poll::Ready(Err(Error::Internal(
                "USB future polled after it completed".into(),
            ))),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Device {
    /// Submits `transfer`, and returns a future that resolves to `map` of the completed transfer.
    fn submit_async<T, F>(&self, endpoint: UsbResult<EndpointInfo>, transfer: Transfer, map: F) -> UsbFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(Transfer) -> T + Send + 'static,
    {
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(error) => return UsbFuture::ready(Err(error)),
        };

        let future = UsbFuture::new();
        let complete = future.completer();
        let submitted = self.submit_in_background(&endpoint, transfer, move |result| {
            complete(result.map(map))
        });

        match submitted {
            Ok(()) => future,
            Err(error) => UsbFuture::ready(Err(error)),
        }
    }

    /// Receives up to `length` bytes from a bulk or interrupt IN endpoint, asynchronously.
    pub fn transfer_in_async(&self, endpoint: u8, length: usize) -> UsbFuture<Vec<u8>> {
        let endpoint = self.endpoint(
            Direction::In,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        );
        self.submit_async(endpoint, Transfer::with_length(length), Transfer::into_data)
    }

    /// Sends data to a bulk or interrupt OUT endpoint, asynchronously.
    /// Resolves to the number of bytes the device accepted.
    pub fn transfer_out_async(&self, endpoint: u8, data: Vec<u8>) -> UsbFuture<usize> {
        let endpoint = self.endpoint(
            Direction::Out,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        );
        self.submit_async(endpoint, Transfer::new(data), |transfer| transfer.data().len())
    }

    /// Performs a control transfer with an IN data stage of up to `length` bytes, asynchronously.
    pub fn control_transfer_in_async(&self, request: &ControlRequest, length: u16) -> UsbFuture<Vec<u8>> {
        let setup = request.setup_packet(Direction::In, length);
        let transfer = Transfer::control(setup, &vec![0; length as usize]);
        self.submit_async(Ok(EndpointInfo::control()), transfer, Transfer::into_data)
    }

    /// Performs a control transfer with an OUT data stage, asynchronously.
    pub fn control_transfer_out_async(&self, request: &ControlRequest, data: &[u8]) -> UsbFuture<usize> {
        let Ok(length) = u16::try_from(data.len()) else {
            return UsbFuture::ready(Err(Error::InvalidArgument(format!(
                "control transfer data stage of {} bytes is too long",
                data.len()
            ))));
        };

        let setup = request.setup_packet(Direction::Out, length);
        let transfer = Transfer::control(setup, data);
        self.submit_async(Ok(EndpointInfo::control()), transfer, |transfer| {
            transfer.data().len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock;
    use crate::request::{DescriptorType, StandardDeviceRequest};

    #[test]
    fn transfers_complete_asynchronously() {
        let (device, handle) = mock::open_mock_device();
        device.claim_interface(0).unwrap();

        let pending = device.transfer_in_async(1, 64);
        handle.wait_for(|hardware| hardware.waiting_on(0x81) == 1);
        handle.feed(0x81, b"async");
        assert_eq!(smol::block_on(pending).unwrap(), b"async".to_vec());

        let sent = smol::block_on(device.transfer_out_async(2, vec![1, 2, 3, 4])).unwrap();
        assert_eq!(sent, 4);
        assert_eq!(handle.hardware().written, vec![(0x02, vec![1, 2, 3, 4])]);
    }

    #[test]
    fn async_control_round_trip() {
        let (device, handle) = mock::open_mock_device();
        handle.set_control_response(&[0x12, 0x01]);

        let request = ControlRequest::standard(
            StandardDeviceRequest::GetDescriptor,
            (DescriptorType::Device as u16) << 8,
            0,
        );
        let data = smol::block_on(device.control_transfer_in_async(&request, 18)).unwrap();
        assert_eq!(data, vec![0x12, 0x01]);
    }

    #[test]
    fn submission_errors_resolve_immediately() {
        let (device, handle) = mock::open_mock_device();

        // Interface 0 isn't claimed.
        let result = smol::block_on(device.transfer_in_async(1, 64));
        assert!(matches!(result, Err(Error::InvalidEndpoint(_))));

        device.claim_interface(0).unwrap();
        handle.feed_status(0x81, mock::STALL);
        let result = smol::block_on(device.transfer_in_async(1, 64));
        assert!(result.unwrap_err().is_stall());

        device.close();
        let result = smol::block_on(device.transfer_out_async(2, vec![0]));
        assert_eq!(result, Err(Error::DeviceNotOpen));
    }
}
