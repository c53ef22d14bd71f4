//! The background thread that pumps OS completion events.
//!
//! Each platform backend implements [EventSource] over its native notification mechanism
//! (epoll, a CFRunLoop, or an I/O completion port); [EventThread] drives it forever on the
//! single thread that observes raw OS completions.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::{debug, error};

use crate::error::{Error, UsbResult};

/// Name given to the completion thread, as seen in debuggers and `ps -T`.
pub(crate) const THREAD_NAME: &str = "usb async io";

/// A native completion mechanism that the event thread can drive.
pub(crate) trait EventSource: Send + Sync + 'static {
    /// Blocks in the OS wait call, without a timeout, then dispatches every transfer that
    /// the wake reported as complete.
    ///
    /// Returning an error is fatal: the event thread stops, and the USB subsystem is marked
    /// unavailable for the rest of the process.
    fn poll_once(&self) -> UsbResult<()>;
}

/// Handle onto a running event thread; used to find out whether it's still alive.
#[derive(Debug)]
pub(crate) struct EventThread {
    failure: Arc<Mutex<Option<Error>>>,
}

impl EventThread {
    /// Spawns the event thread. It runs until `poll_once` fails or the process exits.
    pub(crate) fn spawn<S: EventSource>(source: Arc<S>) -> UsbResult<Self> {
        let failure = Arc::new(Mutex::new(None));
        let thread_failure = Arc::clone(&failure);

        thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                debug!("USB event thread started");
                loop {
                    if let Err(fault) = source.poll_once() {
                        error!("USB event thread failed; no further transfers will complete: {fault}");
                        *thread_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
                        return;
                    }
                }
            })
            .map_err(|spawn_error| {
                Error::SubsystemUnavailable(format!("could not start USB event thread: {spawn_error}"))
            })?;

        Ok(EventThread { failure })
    }

    /// Fails with [Error::SubsystemUnavailable] if the event thread has died.
    pub(crate) fn check(&self) -> UsbResult<()> {
        match &*self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(fault) => Err(Error::SubsystemUnavailable(fault.to_string())),
            None => Ok(()),
        }
    }
}

/// Helper for engines that start their thread lazily; checks a possibly-absent thread.
pub(crate) fn check_thread(thread: &Mutex<Option<EventThread>>) -> UsbResult<()> {
    match &*thread.lock().unwrap_or_else(PoisonError::into_inner) {
        Some(thread) => thread.check(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use super::*;

    /// Succeeds a fixed number of times, then reports a fatal wait failure.
    struct FlakySource {
        polls: AtomicUsize,
        healthy_polls: usize,
    }

    impl EventSource for FlakySource {
        fn poll_once(&self) -> UsbResult<()> {
            let count = self.polls.fetch_add(1, Ordering::SeqCst);
            if count >= self.healthy_polls {
                return Err(Error::Internal("wait call failed".into()));
            }
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }
    }

    #[test]
    fn fatal_poll_error_marks_subsystem_unavailable() {
        let source = Arc::new(FlakySource {
            polls: AtomicUsize::new(0),
            healthy_polls: 3,
        });
        let thread = EventThread::spawn(Arc::clone(&source)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while thread.check().is_ok() {
            assert!(Instant::now() < deadline, "event thread never failed");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(matches!(
            thread.check(),
            Err(Error::SubsystemUnavailable(message)) if message.contains("wait call failed")
        ));
        assert_eq!(source.polls.load(Ordering::SeqCst), 4);
    }
}
