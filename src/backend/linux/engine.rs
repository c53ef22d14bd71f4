//! Completion engine for usbdevfs: one epoll instance watching every open device.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libc::c_void;
use log::{debug, trace, warn};

use super::usbfs::{self, Urb};
use crate::engine::{check_thread, EventSource, EventThread};
use crate::error::{Error, UsbResult};
use crate::transfer::TransferIndex;

/// epoll token of the eventfd used to wake the engine; device tokens start at 1.
const WAKE_TOKEN: u64 = 0;

/// Maximum number of readiness events handled per wake.
const MAX_EVENTS: usize = 16;

static SHARED: Mutex<Option<Arc<LinuxEngine>>> = Mutex::new(None);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn last_error(operation: &str) -> Error {
    let error = io::Error::last_os_error();
    Error::OsError {
        message: format!("{operation} failed: {error}"),
        code: i64::from(error.raw_os_error().unwrap_or(0)),
    }
}

pub(crate) struct LinuxEngine {
    epoll: OwnedFd,
    wake: OwnedFd,
    pub(crate) index: TransferIndex<Urb>,

    /// usbfs file descriptors of registered devices, by device token.
    devices: Mutex<HashMap<u64, Arc<OwnedFd>>>,
    thread: Mutex<Option<EventThread>>,
}

impl LinuxEngine {
    /// Returns the process-wide engine, creating it and its thread on first use.
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
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(last_error("epoll_create1"));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let wake = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake < 0 {
            return Err(last_error("eventfd"));
        }
        let wake = unsafe { OwnedFd::from_raw_fd(wake) };

        let engine = LinuxEngine {
            epoll,
            wake,
            index: TransferIndex::new(),
            devices: Mutex::new(HashMap::new()),
            thread: Mutex::new(None),
        };
        engine.watch(engine.wake.as_raw_fd(), libc::EPOLLIN as u32, WAKE_TOKEN)?;
        Ok(engine)
    }

    fn watch(&self, fd: i32, events: u32, token: u64) -> UsbResult<()> {
        let mut event = libc::epoll_event { events, u64: token };
        let result = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if result < 0 {
            return Err(last_error("epoll_ctl"));
        }
        Ok(())
    }

    fn stop_watching(&self, fd: &OwnedFd) {
        // Fails harmlessly if the fd was already removed after a disconnect.
        unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd.as_raw_fd(),
                std::ptr::null_mut(),
            );
        }
    }

    /// Adds a device's usbfs file descriptor to the set the engine waits on.
    /// Returns the device's token.
    pub(crate) fn register(&self, fd: Arc<OwnedFd>) -> UsbResult<u64> {
        let token = self.index.register_owner();

        // usbfs signals reapable URBs as "writable".
        self.watch(fd.as_raw_fd(), libc::EPOLLOUT as u32, token)?;
        debug!("watching usbfs fd {} as device {token}", fd.as_raw_fd());

        lock(&self.devices).insert(token, fd);
        Ok(token)
    }

    /// Removes a device from the set the engine waits on. Its transfers must be drained first.
    pub(crate) fn unregister(&self, token: u64) {
        if let Some(fd) = lock(&self.devices).remove(&token) {
            self.stop_watching(&fd);
            debug!("no longer watching device {token}");
        }
        self.wake();
    }

    fn wake(&self) {
        let value: u64 = 1;
        let written = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &value as *const u64 as *const c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            warn!("could not wake USB event thread: {}", io::Error::last_os_error());
        }
    }

    fn acknowledge_wake(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                &mut value as *mut u64 as *mut c_void,
                std::mem::size_of::<u64>(),
            );
        }
        trace!("USB event thread woken to refresh its device set");
    }

    /// Reaps every completed URB of one device, and completes its transfer.
    fn reap(&self, token: u64) {
        // Holding our own reference keeps the fd from being closed and reused under us.
        let Some(fd) = lock(&self.devices).get(&token).cloned() else {
            trace!("readiness for unregistered device {token}; ignoring it");
            return;
        };

        loop {
            let urb = match unsafe { usbfs::reap_urb(fd.as_fd()) } {
                Ok(urb) => urb,
                Err(error) => match after_reap_error(&error) {
                    AfterReapError::Drained => return,
                    AfterReapError::Retry => continue,
                    AfterReapError::Gone => {
                        debug!("device {token} is gone; no longer watching it");
                        self.stop_watching(&fd);
                        return;
                    }
                    AfterReapError::Broken => {
                        warn!("could not reap URB of device {token}; no longer watching it: {error}");
                        self.stop_watching(&fd);
                        return;
                    }
                },
            };

            // The URB stays allocated, in the index or its freelist, for the life of the engine.
            let id = unsafe { (*urb).usercontext } as usize as u64;
            self.index.complete(id, |urb, _| {
                let code = -i64::from(urb.status);
                (code, urb.actual_length.max(0) as usize)
            });
        }
    }
}

/// What a failed REAPURBNDELAY means for the device being reaped.
#[derive(Debug, PartialEq, Eq)]
enum AfterReapError {
    /// Nothing left to reap for now.
    Drained,
    Retry,
    Gone,

    /// Unexpected; the fd stays readable, so it must not stay watched.
    Broken,
}

fn after_reap_error(error: &io::Error) -> AfterReapError {
    match error.raw_os_error() {
        Some(libc::EAGAIN) => AfterReapError::Drained,
        Some(libc::EINTR) => AfterReapError::Retry,
        Some(libc::ENODEV) | Some(libc::EBADF) => AfterReapError::Gone,
        _ => AfterReapError::Broken,
    }
}

impl EventSource for LinuxEngine {
    fn poll_once(&self) -> UsbResult<()> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let count = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                -1,
            )
        };
        if count < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(last_error("epoll_wait"));
        }

        for event in &events[..count as usize] {
            let token = event.u64;
            if token == WAKE_TOKEN {
                self.acknowledge_wake();
            } else {
                self.reap(token);
            }
        }

        Ok(())
    }
}

impl fmt::Debug for LinuxEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinuxEngine")
            .field("epoll", &self.epoll)
            .field("devices", &lock(&self.devices).len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_an_empty_queue_or_a_signal_keeps_a_device_watched() {
        let reap_error = |errno| after_reap_error(&io::Error::from_raw_os_error(errno));

        assert_eq!(reap_error(libc::EAGAIN), AfterReapError::Drained);
        assert_eq!(reap_error(libc::EINTR), AfterReapError::Retry);
        assert_eq!(reap_error(libc::ENODEV), AfterReapError::Gone);
        assert_eq!(reap_error(libc::EBADF), AfterReapError::Gone);
        assert_eq!(reap_error(libc::EFAULT), AfterReapError::Broken);
        assert_eq!(reap_error(libc::EINVAL), AfterReapError::Broken);
    }
}
