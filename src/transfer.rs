//! Transfer records, and the index that tracks them while the OS owns them.
//!
//! A [Transfer] owns its buffer for its entire life. While a transfer is in flight, it lives
//! inside a [TransferIndex] entry together with the native request structure the OS is
//! working with; the heap allocations of both never move until the engine thread removes the
//! entry on completion.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::Error;
use crate::request::SETUP_PACKET_SIZE;

/// Continuation run on the engine thread once the OS reports a transfer as finished.
/// It must not block: every other completion in the process waits behind it.
pub type Completion = Box<dyn FnOnce(Transfer) + Send + 'static>;

/// One logical USB transfer: its buffer, its outcome, and who to tell once it completes.
pub struct Transfer {
    buffer: Vec<u8>,

    /// Where the data stage starts in `buffer`; control transfers keep their setup packet
    /// in front of the data.
    data_offset: usize,
    requested_length: usize,
    result_code: i64,

    /// None while the transfer is pending.
    result_length: Option<usize>,
    completion: Option<Completion>,
}

impl Transfer {
    /// Creates a transfer that moves up to `buffer.len()` bytes.
    pub fn new(buffer: Vec<u8>) -> Self {
        let requested_length = buffer.len();

        Transfer {
            buffer,
            data_offset: 0,
            requested_length,
            result_code: 0,
            result_length: Some(0),
            completion: None,
        }
    }

    /// Creates a zero-filled transfer, suitable for an IN transfer of up to `length` bytes.
    pub fn with_length(length: usize) -> Self {
        Self::new(vec![0; length])
    }

    /// Creates a control transfer. `data` is the OUT data stage, or a zero-filled region of
    /// the desired size for IN transfers.
    pub fn control(setup: [u8; SETUP_PACKET_SIZE], data: &[u8]) -> Self {
        let mut buffer = Vec::with_capacity(SETUP_PACKET_SIZE + data.len());
        buffer.extend_from_slice(&setup);
        buffer.extend_from_slice(data);

        Transfer {
            buffer,
            data_offset: SETUP_PACKET_SIZE,
            requested_length: data.len(),
            result_code: 0,
            result_length: Some(0),
            completion: None,
        }
    }

    /// Sets the continuation to run when the transfer completes.
    /// Each submission consumes the completion, so it must be set again before resubmitting.
    pub fn set_completion<F>(&mut self, completion: F)
    where
        F: FnOnce(Transfer) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
    }

    pub fn requested_length(&self) -> usize {
        self.requested_length
    }

    /// Changes how many bytes the next submission moves; never more than the buffer holds.
    pub fn set_requested_length(&mut self, length: usize) {
        assert!(
            length <= self.capacity(),
            "requested length {length} exceeds transfer capacity {}",
            self.capacity()
        );
        self.requested_length = length;
    }

    /// Size of the data region, excluding any setup packet.
    pub fn capacity(&self) -> usize {
        self.buffer.len() - self.data_offset
    }

    /// The bytes actually transferred, once completed; empty while pending.
    pub fn data(&self) -> &[u8] {
        let length = self.result_length.unwrap_or(0);
        &self.buffer[self.data_offset..self.data_offset + length]
    }

    /// The requested data region; fill this before submitting an OUT transfer.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = self.data_offset + self.requested_length;
        &mut self.buffer[self.data_offset..end]
    }

    /// The setup packet, for control transfers.
    pub fn setup_packet(&self) -> Option<&[u8]> {
        (self.data_offset == SETUP_PACKET_SIZE).then(|| &self.buffer[..SETUP_PACKET_SIZE])
    }

    /// OS-specific status code; 0 on success.
    pub fn result_code(&self) -> i64 {
        self.result_code
    }

    /// Bytes transferred, or None if the transfer is pending.
    pub fn result_length(&self) -> Option<usize> {
        self.result_length
    }

    pub fn is_pending(&self) -> bool {
        self.result_length.is_none()
    }

    /// Consumes the transfer, returning only the bytes actually transferred.
    pub fn into_data(mut self) -> Vec<u8> {
        let length = self.result_length.unwrap_or(0);
        self.buffer.truncate(self.data_offset + length);
        self.buffer.drain(..self.data_offset);
        self.buffer
    }

    /// Pointer to, and length of, the whole native buffer: setup packet included.
    pub(crate) fn native_buffer(&mut self) -> (*mut u8, usize) {
        (
            self.buffer.as_mut_ptr(),
            self.data_offset + self.requested_length,
        )
    }

    /// Pointer to, and length of, only the data stage.
    pub(crate) fn native_data(&mut self) -> (*mut u8, usize) {
        let offset = self.data_offset;
        (
            self.buffer[offset..].as_mut_ptr(),
            self.requested_length,
        )
    }

    /// Marks the transfer as pending, immediately before it's handed to the OS.
    fn mark_pending(&mut self) {
        self.result_code = 0;
        self.result_length = None;
    }

    /// Records the outcome and runs the completion. Consumes the transfer; the completion
    /// gets it back.
    pub(crate) fn complete(mut self, result_code: i64, result_length: usize) {
        self.result_code = result_code;
        self.result_length = Some(result_length.min(self.requested_length));

        match self.completion.take() {
            Some(completion) => completion(self),
            None => warn!("transfer completed with no completion attached; dropping it"),
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("capacity", &self.capacity())
            .field("requested_length", &self.requested_length)
            .field("result_code", &self.result_code)
            .field("result_length", &self.result_length)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

/// A submission the OS refused; carries the transfer back so its buffer isn't lost.
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    pub transfer: Transfer,
}

impl From<Rejected> for Error {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// A transfer the OS is currently working on.
struct InFlight<N> {
    transfer: Transfer,
    native: Box<N>,

    /// Token of the device the transfer was submitted against.
    owner: u64,
    endpoint_address: u8,
}

struct IndexState<N> {
    last_id: u64,
    last_owner: u64,
    pending: HashMap<u64, InFlight<N>>,

    /// Native structures that have been used before; never freed, only recycled.
    free: Vec<Box<N>>,

    /// Completions that have been removed from `pending` but whose callbacks are still running.
    completing: usize,
}

/// Maps transfer ids to in-flight transfers and their native request structures.
///
/// One instance exists per completion engine. Insertion and the OS submission happen under the
/// same lock, so the engine thread can never observe a completion for an id it doesn't know yet.
pub(crate) struct TransferIndex<N> {
    state: Mutex<IndexState<N>>,
    changed: Condvar,
}

impl<N: Default> TransferIndex<N> {
    pub(crate) fn new() -> Self {
        TransferIndex {
            state: Mutex::new(IndexState {
                last_id: 0,
                last_owner: 0,
                pending: HashMap::new(),
                free: vec![],
                completing: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState<N>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a token identifying a device for the lifetime of the process.
    pub(crate) fn register_owner(&self) -> u64 {
        let mut state = self.lock();
        state.last_owner += 1;
        state.last_owner
    }

    /// Prepares a transfer and hands it to the OS via `submit`, which receives the new
    /// transfer id, a recycled native structure, and the transfer itself.
    ///
    /// On success the transfer belongs to the index until the engine completes it.
    pub(crate) fn submit<F>(
        &self,
        owner: u64,
        endpoint_address: u8,
        mut transfer: Transfer,
        submit: F,
    ) -> Result<u64, Rejected>
    where
        F: FnOnce(u64, &mut N, &mut Transfer) -> Result<(), Error>,
    {
        let mut state = self.lock();

        state.last_id += 1;
        let id = state.last_id;
        let mut native = state.free.pop().unwrap_or_default();

        transfer.mark_pending();
        if let Err(error) = submit(id, &mut native, &mut transfer) {
            state.free.push(native);
            transfer.result_length = Some(0);
            return Err(Rejected { error, transfer });
        }

        trace!("submitted transfer {id} on endpoint {endpoint_address:#04x}");
        let previous = state.pending.insert(
            id,
            InFlight {
                transfer,
                native,
                owner,
                endpoint_address,
            },
        );
        assert!(
            previous.is_none(),
            "internal consistency: transfer {id} entered the pending index twice"
        );

        Ok(id)
    }

    /// Completes the transfer with the given id. `result` extracts the (code, length) pair from
    /// the native structure; it may also copy data into the transfer.
    ///
    /// Unknown ids are logged and ignored; they show up when devices close under the engine.
    /// Returns whether a transfer was completed.
    pub(crate) fn complete<F>(&self, id: u64, result: F) -> bool
    where
        F: FnOnce(&mut N, &mut Transfer) -> (i64, usize),
    {
        self.finish(id, result, true)
    }

    fn finish<F>(&self, id: u64, result: F, os_done: bool) -> bool
    where
        F: FnOnce(&mut N, &mut Transfer) -> (i64, usize),
    {
        let (transfer, code, length) = {
            let mut state = self.lock();
            let Some(mut entry) = state.pending.remove(&id) else {
                warn!("completion for unknown transfer {id}; ignoring it");
                return false;
            };

            let (code, length) = result(&mut entry.native, &mut entry.transfer);
            if os_done {
                state.free.push(entry.native);
            } else {
                quarantine(entry.native, &mut entry.transfer);
            }
            state.completing += 1;
            (entry.transfer, code, length)
        };

        trace!("transfer {id} completed with code {code}, {length} bytes");
        transfer.complete(code, length);

        let mut state = self.lock();
        state.completing -= 1;
        self.changed.notify_all();

        true
    }

    /// Runs `action` on the native structure of every pending transfer belonging to `owner`
    /// (and, if given, to one endpoint address). The index stays locked throughout, so no
    /// native structure can be recycled under `action`.
    pub(crate) fn for_each_pending<F>(&self, owner: u64, endpoint_address: Option<u8>, mut action: F)
    where
        F: FnMut(u64, &mut N),
    {
        let mut state = self.lock();
        for (id, entry) in state.pending.iter_mut() {
            if entry.owner != owner {
                continue;
            }
            if endpoint_address.map_or(false, |address| address != entry.endpoint_address) {
                continue;
            }

            action(*id, &mut entry.native);
        }
    }

    /// Number of transfers still pending for the given owner.
    pub(crate) fn pending_for(&self, owner: u64) -> usize {
        self.lock()
            .pending
            .values()
            .filter(|entry| entry.owner == owner)
            .count()
    }

    #[cfg(test)]
    pub(crate) fn pending_total(&self) -> usize {
        self.lock().pending.len()
    }

    /// Blocks until every transfer of `owner` has completed and had its completion run, or
    /// until `timeout` elapses. Returns true if the owner is fully drained.
    ///
    /// Must not be called from the engine thread.
    pub(crate) fn wait_until_drained(&self, owner: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            let busy = state.completing > 0
                || state.pending.values().any(|entry| entry.owner == owner);
            if !busy {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Completes every remaining transfer of `owner` with `code`. Last resort for devices
    /// whose OS handle is going away while the OS still reports transfers as busy.
    ///
    /// The OS may still write to these transfers, so their native structures and buffers are
    /// never reused; each transfer is handed back with a fresh buffer of the same size.
    pub(crate) fn fail_pending(&self, owner: u64, code: i64) -> usize {
        let stragglers: Vec<u64> = {
            let state = self.lock();
            state
                .pending
                .iter()
                .filter(|(_, entry)| entry.owner == owner)
                .map(|(id, _)| *id)
                .collect()
        };

        stragglers
            .into_iter()
            .filter(|id| self.finish(*id, |_, _| (code, 0), false))
            .count()
    }
}

/// Leaks a native structure and transfer buffer the OS may still be writing to.
fn quarantine<N>(native: Box<N>, transfer: &mut Transfer) {
    let replacement = vec![0; transfer.buffer.len()];
    let abandoned = mem::replace(&mut transfer.buffer, replacement);

    warn!("abandoning {} bytes of transfer state the OS never gave back", abandoned.len());
    mem::forget(abandoned);
    mem::forget(native);
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[derive(Default, Debug)]
    struct FakeNative {
        id: u64,
        status: i64,
        actual_length: usize,
    }

    fn submit_ok(index: &TransferIndex<FakeNative>, owner: u64, transfer: Transfer) -> u64 {
        index
            .submit(owner, 0x81, transfer, |id, native, _| {
                native.id = id;
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn completion_runs_exactly_once() {
        let index = TransferIndex::<FakeNative>::new();
        let (sender, receiver) = mpsc::channel();

        let mut transfer = Transfer::with_length(64);
        transfer.set_completion(move |transfer| sender.send(transfer).unwrap());
        let id = submit_ok(&index, 1, transfer);

        assert!(index.complete(id, |native, _| {
            native.actual_length = 10;
            (0, native.actual_length)
        }));
        // A duplicate OS notification for the same id is ignored.
        assert!(!index.complete(id, |_, _| (0, 64)));

        let completed = receiver.recv().unwrap();
        assert_eq!(completed.result_length(), Some(10));
        assert!(receiver.try_recv().is_err());
        assert_eq!(index.pending_for(1), 0);
    }

    #[test]
    fn rejected_submission_returns_transfer_and_recycles_native() {
        let index = TransferIndex::<FakeNative>::new();

        let rejected = index
            .submit(1, 0x02, Transfer::with_length(8), |_, _, _| {
                Err(Error::DeviceNotOpen)
            })
            .unwrap_err();

        assert_eq!(rejected.error, Error::DeviceNotOpen);
        assert_eq!(rejected.transfer.capacity(), 8);
        assert!(!rejected.transfer.is_pending());
        assert_eq!(index.pending_for(1), 0);
        assert_eq!(index.lock().free.len(), 1);
    }

    #[test]
    fn ids_are_never_reused() {
        let index = TransferIndex::<FakeNative>::new();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..100 {
            let mut transfer = Transfer::with_length(1);
            transfer.set_completion(|_| {});
            let id = submit_ok(&index, 7, transfer);
            assert!(seen.insert(id));
            index.complete(id, |native, _| (native.status, 0));
        }

        // Native structures get recycled, ids don't.
        assert_eq!(index.lock().free.len(), 1);
    }

    #[test]
    fn abort_selects_by_owner_and_endpoint() {
        let index = TransferIndex::<FakeNative>::new();
        for (owner, endpoint) in [(1, 0x81), (1, 0x02), (2, 0x81)] {
            let mut transfer = Transfer::with_length(4);
            transfer.set_completion(|_| {});
            index
                .submit(owner, endpoint, transfer, |_, _, _| Ok(()))
                .unwrap();
        }

        let mut visited = 0;
        index.for_each_pending(1, Some(0x81), |_, _| visited += 1);
        assert_eq!(visited, 1);

        visited = 0;
        index.for_each_pending(1, None, |_, _| visited += 1);
        assert_eq!(visited, 2);
    }

    #[test]
    fn drain_waits_for_completion_callbacks() {
        let index = Arc::new(TransferIndex::<FakeNative>::new());
        let (sender, receiver) = mpsc::channel();

        let mut transfer = Transfer::with_length(4);
        transfer.set_completion(move |_| {
            thread::sleep(Duration::from_millis(20));
            sender.send(()).unwrap();
        });
        let id = submit_ok(&index, 3, transfer);

        assert!(!index.wait_until_drained(3, Duration::from_millis(10)));

        let engine = Arc::clone(&index);
        let handle = thread::spawn(move || engine.complete(id, |_, _| (0, 4)));

        assert!(index.wait_until_drained(3, Duration::from_secs(5)));
        // The callback has finished by the time the drain returns.
        assert!(receiver.try_recv().is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn fail_pending_completes_stragglers() {
        let index = TransferIndex::<FakeNative>::new();
        let (sender, receiver) = mpsc::channel();

        for _ in 0..3 {
            let sender = sender.clone();
            let mut transfer = Transfer::with_length(4);
            transfer.set_completion(move |transfer| sender.send(transfer.result_code()).unwrap());
            submit_ok(&index, 9, transfer);
        }

        assert_eq!(index.fail_pending(9, 19), 3);
        assert_eq!(receiver.iter().take(3).collect::<Vec<_>>(), vec![19, 19, 19]);
        assert!(index.wait_until_drained(9, Duration::ZERO));
    }

    #[test]
    fn failed_stragglers_never_lend_their_memory_to_new_transfers() {
        let index = TransferIndex::<FakeNative>::new();
        let (sender, receiver) = mpsc::channel();

        let mut transfer = Transfer::with_length(16);
        let (abandoned_buffer, _) = transfer.native_buffer();
        transfer.set_completion(move |transfer| sender.send(transfer).unwrap());
        let straggler = submit_ok(&index, 4, transfer);

        let mut abandoned_native = std::ptr::null();
        index.for_each_pending(4, None, |_, native| abandoned_native = native as *const FakeNative);

        assert_eq!(index.fail_pending(4, 19), 1);
        assert_eq!(index.lock().free.len(), 0);

        // The caller gets a usable transfer back, backed by different memory.
        let mut failed = receiver.recv().unwrap();
        assert_eq!(failed.result_code(), 19);
        assert_eq!(failed.capacity(), 16);
        assert_ne!(failed.native_buffer().0, abandoned_buffer);

        // A late completion from the OS finds nothing to complete.
        assert!(!index.complete(straggler, |_, _| (0, 16)));

        let mut reused = std::ptr::null();
        let mut next = Transfer::with_length(16);
        next.set_completion(|_| {});
        index
            .submit(5, 0x81, next, |_, native, _| {
                reused = native as *const FakeNative;
                Ok(())
            })
            .unwrap();
        assert_ne!(reused, abandoned_native);
    }

    #[test]
    fn control_transfer_layout() {
        let setup = [0x80, 6, 0, 1, 0, 0, 18, 0];
        let mut transfer = Transfer::control(setup, &[0; 18]);

        assert_eq!(transfer.capacity(), 18);
        assert_eq!(transfer.setup_packet(), Some(&setup[..]));
        assert_eq!(transfer.native_buffer().1, 26);
        assert_eq!(transfer.native_data().1, 18);

        transfer.result_length = Some(18);
        transfer.data_mut()[0] = 0x12;
        assert_eq!(transfer.into_data()[0], 0x12);
    }
}
