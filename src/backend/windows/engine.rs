//! Completion engine for WinUSB: one I/O completion port that every open device handle is
//! associated with.

use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, FALSE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED};
use windows_sys::Win32::System::Threading::INFINITE;

use super::last_error;
use crate::engine::{check_thread, EventSource, EventThread};
use crate::error::{Error, UsbResult};
use crate::transfer::TransferIndex;

static SHARED: Mutex<Option<Arc<WindowsEngine>>> = Mutex::new(None);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-transfer native state: the OVERLAPPED handed to WinUSB, followed by the transfer id.
/// The completion port hands back a pointer to the OVERLAPPED, which is also a pointer to this.
#[repr(C)]
pub(crate) struct NativeOverlapped {
    pub(crate) overlapped: OVERLAPPED,
    pub(crate) id: u64,
}

impl NativeOverlapped {
    /// Clears the OVERLAPPED for a new request, and tags it with the transfer's id.
    pub(crate) fn prepare(&mut self, id: u64) -> *mut OVERLAPPED {
        *self = NativeOverlapped::default();
        self.id = id;
        &mut self.overlapped
    }
}

impl Default for NativeOverlapped {
    fn default() -> Self {
        // An all-zero OVERLAPPED is the documented initial state.
        NativeOverlapped {
            overlapped: unsafe { std::mem::zeroed() },
            id: 0,
        }
    }
}

// The OVERLAPPED is only touched by the kernel while pending, and otherwise under the index's lock.
unsafe impl Send for NativeOverlapped {}

/// An owned Win32 handle.
struct OwnedHandle(HANDLE);

// Kernel handles may be used from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

pub(crate) struct WindowsEngine {
    port: OwnedHandle,
    pub(crate) index: TransferIndex<NativeOverlapped>,
    thread: Mutex<Option<EventThread>>,
}

impl WindowsEngine {
    /// Returns the process-wide engine, creating the completion port and its thread on first use.
    pub(crate) fn shared() -> UsbResult<Arc<Self>> {
        let mut shared = lock(&SHARED);
        if let Some(engine) = &*shared {
            check_thread(&engine.thread)?;
            return Ok(Arc::clone(engine));
        }

        let engine = Arc::new(Self::new()?);
        *lock(&engine.thread) = Some(EventThread::spawn(Arc::clone(&engine))?);
        *shared = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Fails if the shared engine exists and its thread has died.
    pub(crate) fn check_shared() -> UsbResult<()> {
        match &*lock(&SHARED) {
            Some(engine) => check_thread(&engine.thread),
            None => Ok(()),
        }
    }

    fn new() -> UsbResult<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(last_error("creating I/O completion port"));
        }

        Ok(WindowsEngine {
            port: OwnedHandle(port),
            index: TransferIndex::new(),
            thread: Mutex::new(None),
        })
    }

    /// Associates a device handle, opened for overlapped I/O, with the completion port.
    /// Returns the device's token.
    pub(crate) fn register(&self, handle: HANDLE) -> UsbResult<u64> {
        let token = self.index.register_owner();

        let port = unsafe { CreateIoCompletionPort(handle, self.port.0, token as usize, 0) };
        if port.is_null() {
            return Err(last_error("associating device with I/O completion port"));
        }

        debug!("device handle {handle:?} registered as device {token}");
        Ok(token)
    }
}

impl EventSource for WindowsEngine {
    fn poll_once(&self) -> UsbResult<()> {
        let mut transferred: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

        let succeeded = unsafe {
            GetQueuedCompletionStatus(
                self.port.0,
                &mut transferred,
                &mut key,
                &mut overlapped,
                INFINITE,
            )
        };

        // Without an OVERLAPPED, the failure is the port's own rather than a transfer's.
        if overlapped.is_null() {
            return Err(match succeeded {
                FALSE => last_error("waiting on I/O completion port"),
                _ => Error::Internal("I/O completion port woke without a request".into()),
            });
        }

        let code = match succeeded {
            FALSE => i64::from(unsafe { GetLastError() }),
            _ => 0,
        };

        // Every OVERLAPPED we submit is the head of a NativeOverlapped, alive until completed.
        let id = unsafe { (*overlapped.cast::<NativeOverlapped>()).id };
        trace!("completion for transfer {id} of device {key}: code {code}, {transferred} bytes");

        self.index.complete(id, |native, _| {
            (code, native.overlapped.InternalHigh)
        });
        Ok(())
    }
}

impl fmt::Debug for WindowsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowsEngine")
            .field("port", &self.port.0)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapped_leads_the_native_structure() {
        let mut native = NativeOverlapped::default();
        let overlapped = native.prepare(42);

        assert_eq!(overlapped.cast::<NativeOverlapped>() as *const _, &native as *const _);
        assert_eq!(native.id, 42);
        assert_eq!(native.overlapped.InternalHigh, 0);
    }
}
