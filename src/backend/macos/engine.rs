//! Completion engine for IOKit: one CFRunLoop, run by the event thread, holding the async
//! event source of every open device and claimed interface.

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, CFRunLoopAddSource, CFRunLoopGetCurrent, CFRunLoopRef,
    CFRunLoopRemoveSource, CFRunLoopRunInMode, CFRunLoopWakeUp,
};
use io_kit_sys::ret::IOReturn;
use log::{debug, trace, warn};

use super::iokit::RunLoopSource;
use super::iokit_c::IOUSBDevRequest;
use crate::engine::{check_thread, EventSource, EventThread};
use crate::error::UsbResult;
use crate::transfer::TransferIndex;

/// Run loop timeout that never expires, as CFRunLoopRun itself uses. A run only ends once the
/// last source has been removed.
const RUN_FOREVER: f64 = 1.0e10;

/// How long registering a source waits, per check, for the event thread's run loop to exist.
const STARTUP_POLL: Duration = Duration::from_millis(100);

static SHARED: Mutex<Option<Arc<MacOsEngine>>> = Mutex::new(None);

thread_local! {
    /// The engine whose run loop the current thread is running; null outside of a run.
    static RUNNING: Cell<*const MacOsEngine> = Cell::new(std::ptr::null());
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-transfer native state; only control requests need any.
#[derive(Default)]
pub(crate) struct NativeRequest {
    pub(crate) request: IOUSBDevRequest,
}

// The request is only read by IOKit, and written under the transfer index's lock.
unsafe impl Send for NativeRequest {}

struct RunLoop(CFRunLoopRef);

// CFRunLoop functions that take a run loop are safe to call from any thread.
unsafe impl Send for RunLoop {}

struct LoopState {
    run_loop: Option<RunLoop>,
    sources: usize,
}

pub(crate) struct MacOsEngine {
    pub(crate) index: TransferIndex<NativeRequest>,
    state: Mutex<LoopState>,
    changed: Condvar,
    thread: Mutex<Option<EventThread>>,
}

impl MacOsEngine {
    /// Returns the process-wide engine, creating it and its thread on first use.
    pub(crate) fn shared() -> UsbResult<Arc<Self>> {
        let mut shared = lock(&SHARED);
        if let Some(engine) = &*shared {
            check_thread(&engine.thread)?;
            return Ok(Arc::clone(engine));
        }

        let engine = Arc::new(MacOsEngine {
            index: TransferIndex::new(),
            state: Mutex::new(LoopState {
                run_loop: None,
                sources: 0,
            }),
            changed: Condvar::new(),
            thread: Mutex::new(None),
        });
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

    /// Adds an event source to the run loop; its completions are dispatched from then on.
    pub(crate) fn add_source(&self, source: RunLoopSource) -> UsbResult<()> {
        let mut state = lock(&self.state);
        loop {
            if let Some(run_loop) = &state.run_loop {
                unsafe {
                    CFRunLoopAddSource(run_loop.0, source.0, kCFRunLoopDefaultMode);
                    CFRunLoopWakeUp(run_loop.0);
                }
                break;
            }

            check_thread(&self.thread)?;
            state = self
                .changed
                .wait_timeout(state, STARTUP_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        state.sources += 1;
        debug!("run loop now holds {} event sources", state.sources);
        self.changed.notify_all();
        Ok(())
    }

    pub(crate) fn remove_source(&self, source: RunLoopSource) {
        let mut state = lock(&self.state);
        let Some(run_loop) = &state.run_loop else {
            return;
        };

        unsafe {
            CFRunLoopRemoveSource(run_loop.0, source.0, kCFRunLoopDefaultMode);
            CFRunLoopWakeUp(run_loop.0);
        }
        state.sources = state.sources.saturating_sub(1);
        debug!("run loop now holds {} event sources", state.sources);
    }
}

/// Completion callback handed to IOKit for every request. The refcon carries the transfer id;
/// `arg0` the number of bytes transferred.
pub(crate) unsafe extern "C" fn transfer_completed(refcon: *mut c_void, result: IOReturn, arg0: *mut c_void) {
    let id = refcon as usize as u64;
    let length = arg0 as usize;

    RUNNING.with(|running| {
        let engine = running.get();
        if engine.is_null() {
            warn!("IOKit completed transfer {id} outside of the engine's run loop; dropping it");
            return;
        }

        // Callbacks only run inside poll_once, which holds a reference to the engine.
        let engine = unsafe { &*engine };
        engine.index.complete(id, |_, _| (i64::from(result), length));
    });
}

impl EventSource for MacOsEngine {
    fn poll_once(&self) -> UsbResult<()> {
        {
            let mut state = lock(&self.state);
            if state.run_loop.is_none() {
                state.run_loop = Some(RunLoop(unsafe { CFRunLoopGetCurrent() }));
                self.changed.notify_all();
            }

            // A run loop without sources returns immediately; sleep until one is added.
            while state.sources == 0 {
                state = self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        RUNNING.with(|running| running.set(self));
        let result = unsafe { CFRunLoopRunInMode(kCFRunLoopDefaultMode, RUN_FOREVER, 0) };
        RUNNING.with(|running| running.set(std::ptr::null()));

        trace!("run loop returned {result}");
        Ok(())
    }
}

impl fmt::Debug for MacOsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacOsEngine")
            .field("sources", &lock(&self.state).sources)
            .finish_non_exhaustive()
    }
}
