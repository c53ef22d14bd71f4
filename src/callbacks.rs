//! Callback-model asynchronous transfers.
//!
//! Callbacks run on the engine thread. They must return quickly: no other transfer in the
//! process completes while one is running.

use crate::backend::EndpointInfo;
use crate::descriptor::TransferType;
use crate::device::Device;
use crate::error::UsbResult;
use crate::request::{ControlRequest, Direction};
use crate::transfer::Transfer;

/// Type used for callbacks in the callback-model async functions.
pub type AsyncCallback<T> = Box<dyn FnOnce(UsbResult<T>) + Send + 'static>;

impl Device {
    /// Receives up to `length` bytes from a bulk or interrupt IN endpoint; `callback` gets the data.
    ///
    /// Errors detected before submission are returned directly, and the callback is never called.
    pub fn transfer_in_with_callback(
        &self,
        endpoint: u8,
        length: usize,
        callback: AsyncCallback<Vec<u8>>,
    ) -> UsbResult<()> {
        let endpoint = self.endpoint(
            Direction::In,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        )?;

        self.submit_in_background(&endpoint, Transfer::with_length(length), move |result| {
            callback(result.map(Transfer::into_data))
        })
    }

    /// Sends data to a bulk or interrupt OUT endpoint; `callback` gets the number of bytes sent.
    pub fn transfer_out_with_callback(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        callback: AsyncCallback<usize>,
    ) -> UsbResult<()> {
        let endpoint = self.endpoint(
            Direction::Out,
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
        )?;

        self.submit_in_background(&endpoint, Transfer::new(data), move |result| {
            callback(result.map(|transfer| transfer.data().len()))
        })
    }

    /// Performs a control transfer with an IN data stage of up to `length` bytes.
    pub fn control_transfer_in_with_callback(
        &self,
        request: &ControlRequest,
        length: u16,
        callback: AsyncCallback<Vec<u8>>,
    ) -> UsbResult<()> {
        let setup = request.setup_packet(Direction::In, length);
        let transfer = Transfer::control(setup, &vec![0; length as usize]);

        self.submit_in_background(&EndpointInfo::control(), transfer, move |result| {
            callback(result.map(Transfer::into_data))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use crate::backend::mock;
    use crate::error::Error;

    #[test]
    fn callback_receives_data() {
        let (device, handle) = mock::open_mock_device();
        device.claim_interface(0).unwrap();
        handle.feed(0x81, &[4, 5, 6]);

        let (sender, receiver) = mpsc::channel();
        device
            .transfer_in_with_callback(1, 64, Box::new(move |result| sender.send(result).unwrap()))
            .unwrap();

        assert_eq!(receiver.recv().unwrap(), Ok(vec![4, 5, 6]));
    }

    #[test]
    fn submission_errors_skip_the_callback() {
        let (device, _handle) = mock::open_mock_device();

        let result = device.transfer_out_with_callback(
            2,
            vec![1],
            Box::new(|_| panic!("callback must not run")),
        );
        assert!(matches!(result, Err(Error::InvalidEndpoint(_))));
    }
}
