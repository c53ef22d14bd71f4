//! In-memory backend for the test suite: a scriptable device behind its own completion engine.
//!
//! Completions are delivered asynchronously, on an event thread of their own, just like the
//! real backends deliver them.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendDevice, ControlTarget, EndpointInfo};
use crate::descriptor::tests::{sample_configuration, sample_device_descriptor};
use crate::device::{Device, DeviceInformation, DeviceSelector};
use crate::engine::{check_thread, EventSource, EventThread};
use crate::error::{Error, ResultTranslator, UsbResult};
use crate::host::Host;
use crate::request::Direction;
use crate::transfer::{Rejected, Transfer, TransferIndex};

pub(crate) const STALL: i64 = 32;
pub(crate) const CANCELLED: i64 = 104;
pub(crate) const NO_DEVICE: i64 = 19;

pub(crate) fn translate(code: i64, operation: &str) -> Error {
    match code {
        STALL => Error::Stalled {
            message: format!("{operation}: endpoint stalled"),
            code,
        },
        CANCELLED => Error::Aborted {
            message: format!("{operation}: transfer cancelled"),
            code,
        },
        _ => Error::OsError {
            message: format!("{operation}: mock error {code}"),
            code,
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the mock device answers an IN transfer with.
#[derive(Debug)]
enum Reply {
    Data(Vec<u8>),
    Status(i64),
}

/// A completion notification, as the mock "OS" posts it.
#[derive(Debug)]
struct MockEvent {
    id: u64,
    status: i64,
    length: usize,
    data: Option<Vec<u8>>,
}

impl MockEvent {
    fn done(id: u64, status: i64, length: usize) -> Self {
        MockEvent {
            id,
            status,
            length,
            data: None,
        }
    }

    fn reply(id: u64, reply: Reply) -> Self {
        match reply {
            Reply::Data(data) => MockEvent {
                id,
                status: 0,
                length: data.len(),
                data: Some(data),
            },
            Reply::Status(status) => Self::done(id, status, 0),
        }
    }
}

/// State of the simulated device, plus a log of everything done to it.
#[derive(Debug)]
pub(crate) struct Hardware {
    events: Sender<MockEvent>,

    pub(crate) control_response: Vec<u8>,
    control_status: VecDeque<i64>,
    pub(crate) setups: Vec<[u8; 8]>,
    pub(crate) control_targets: Vec<ControlTarget>,
    pub(crate) control_written: Vec<Vec<u8>>,

    replies: HashMap<u8, VecDeque<Reply>>,

    /// Transfers the device hasn't answered yet, per endpoint address, with their lengths.
    waiting: HashMap<u8, VecDeque<(u64, usize)>>,

    out_status: VecDeque<i64>,
    hold_out: bool,
    hold_control: bool,
    abort_failure: Option<i64>,
    pub(crate) written: Vec<(u8, Vec<u8>)>,

    pub(crate) aborted: Vec<u8>,
    pub(crate) cleared: Vec<u8>,
    pub(crate) claimed: Vec<u8>,
    pub(crate) alternates: Vec<(u8, u8)>,
}

impl Hardware {
    fn new(events: Sender<MockEvent>) -> Self {
        Hardware {
            events,
            control_response: vec![],
            control_status: VecDeque::new(),
            setups: vec![],
            control_targets: vec![],
            control_written: vec![],
            replies: HashMap::new(),
            waiting: HashMap::new(),
            out_status: VecDeque::new(),
            hold_out: false,
            hold_control: false,
            abort_failure: None,
            written: vec![],
            aborted: vec![],
            cleared: vec![],
            claimed: vec![],
            alternates: vec![],
        }
    }

    /// Number of transfers waiting for the device to answer on an endpoint.
    pub(crate) fn waiting_on(&self, address: u8) -> usize {
        self.waiting.get(&address).map_or(0, VecDeque::len)
    }

    fn post(&self, event: MockEvent) {
        // The engine only goes away with the whole mock.
        let _ = self.events.send(event);
    }

    fn wait(&mut self, address: u8, id: u64, length: usize) {
        self.waiting.entry(address).or_default().push_back((id, length));
    }

    /// Answers the oldest waiting IN transfer, or queues the reply for the next one.
    fn deliver(&mut self, address: u8, reply: Reply) {
        match self.waiting.get_mut(&address).and_then(VecDeque::pop_front) {
            Some((id, _)) => self.post(MockEvent::reply(id, reply)),
            None => self.replies.entry(address).or_default().push_back(reply),
        }
    }

    fn cancel(&mut self, address: u8) {
        for (id, _) in self.waiting.remove(&address).unwrap_or_default() {
            self.post(MockEvent::done(id, CANCELLED, 0));
        }
    }

    fn cancel_all(&mut self) {
        let addresses: Vec<u8> = self.waiting.keys().copied().collect();
        for address in addresses {
            self.cancel(address);
        }
    }
}

/// The mock's completion engine; the "OS" side posts events into a channel.
pub(crate) struct MockEngine {
    index: TransferIndex<()>,
    events: Mutex<Receiver<MockEvent>>,
    thread: Mutex<Option<EventThread>>,
}

impl MockEngine {
    fn ensure_started(self: &Arc<Self>) -> UsbResult<()> {
        let mut thread = lock(&self.thread);
        match &*thread {
            Some(running) => running.check(),
            None => {
                *thread = Some(EventThread::spawn(Arc::clone(self))?);
                Ok(())
            }
        }
    }
}

impl EventSource for MockEngine {
    fn poll_once(&self) -> UsbResult<()> {
        let event = lock(&self.events)
            .recv()
            .map_err(|_| Error::Closed("mock hardware went away".into()))?;

        self.index.complete(event.id, |_, transfer| {
            let length = match &event.data {
                Some(data) => {
                    let length = data.len().min(transfer.requested_length());
                    transfer.data_mut()[..length].copy_from_slice(&data[..length]);
                    length
                }
                None => event.length,
            };
            (event.status, length)
        });
        Ok(())
    }
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEngine").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct MockDevice {
    engine: Arc<MockEngine>,
    hardware: Arc<Mutex<Hardware>>,
    owner: u64,
    open: bool,
    device_descriptor: Vec<u8>,
    configuration_descriptor: Vec<u8>,
}

impl BackendDevice for MockDevice {
    fn device_descriptor(&self) -> &[u8] {
        &self.device_descriptor
    }

    fn configuration_descriptor(&self) -> &[u8] {
        &self.configuration_descriptor
    }

    fn claim_interface(&mut self, interface: u8, _detach_kernel_driver: bool) -> UsbResult<()> {
        lock(&self.hardware).claimed.push(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> UsbResult<()> {
        lock(&self.hardware).claimed.retain(|claimed| *claimed != interface);
        Ok(())
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> UsbResult<()> {
        lock(&self.hardware).alternates.push((interface, setting));
        Ok(())
    }

    fn submit_control(&mut self, target: ControlTarget, transfer: Transfer) -> Result<(), Rejected> {
        let hardware = &self.hardware;

        self.engine
            .index
            .submit(self.owner, 0, transfer, |id, _, transfer| {
                let Some(packet) = transfer.setup_packet() else {
                    return Err(Error::Internal("control transfer without setup".into()));
                };
                let mut setup = [0; 8];
                setup.copy_from_slice(packet);

                let mut hardware = lock(hardware);
                hardware.setups.push(setup);
                hardware.control_targets.push(target);

                if hardware.hold_control {
                    hardware.wait(0, id, transfer.requested_length());
                    return Ok(());
                }

                let event = match hardware.control_status.pop_front() {
                    Some(status) => MockEvent::done(id, status, 0),
                    None if setup[0] & 0x80 != 0 => {
                        MockEvent::reply(id, Reply::Data(hardware.control_response.clone()))
                    }
                    None => {
                        hardware.control_written.push(transfer.data_mut().to_vec());
                        MockEvent::done(id, 0, transfer.requested_length())
                    }
                };
                hardware.post(event);
                Ok(())
            })
            .map(|_| ())
    }

    fn submit(
        &mut self,
        endpoint: &EndpointInfo,
        transfer: Transfer,
        _timeout: Option<Duration>,
    ) -> Result<(), Rejected> {
        let address = endpoint.address();
        let direction = endpoint.direction;
        let hardware = &self.hardware;

        self.engine
            .index
            .submit(self.owner, address, transfer, |id, _, transfer| {
                let mut hardware = lock(hardware);
                let length = transfer.requested_length();

                match direction {
                    Direction::In => {
                        let queued = hardware
                            .replies
                            .get_mut(&address)
                            .and_then(VecDeque::pop_front);
                        match queued {
                            Some(reply) => hardware.post(MockEvent::reply(id, reply)),
                            None => hardware.wait(address, id, length),
                        }
                    }
                    Direction::Out => {
                        hardware.written.push((address, transfer.data_mut().to_vec()));
                        match hardware.out_status.pop_front() {
                            Some(status) => hardware.post(MockEvent::done(id, status, 0)),
                            None if hardware.hold_out => hardware.wait(address, id, length),
                            None => hardware.post(MockEvent::done(id, 0, length)),
                        }
                    }
                }
                Ok(())
            })
            .map(|_| ())
    }

    fn abort_transfers(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        let mut hardware = lock(&self.hardware);
        hardware.aborted.push(endpoint.address());
        if let Some(code) = hardware.abort_failure {
            return Err(translate(code, "aborting transfers"));
        }
        hardware.cancel(endpoint.address());
        Ok(())
    }

    fn clear_halt(&mut self, endpoint: &EndpointInfo) -> UsbResult<()> {
        lock(&self.hardware).cleared.push(endpoint.address());
        Ok(())
    }

    fn result_translator(&self) -> ResultTranslator {
        translate
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        lock(&self.hardware).cancel_all();
        if !self
            .engine
            .index
            .wait_until_drained(self.owner, Duration::from_secs(1))
        {
            self.engine.index.fail_pending(self.owner, NO_DEVICE);
        }
    }
}

pub(crate) fn mock_information() -> DeviceInformation {
    DeviceInformation {
        vendor_id: 0x1209,
        product_id: 0x0001,
        serial: Some("mock-0001".into()),
        manufacturer: Some("usbdirect".into()),
        product: Some("Mock Device".into()),
        bus_number: Some(1),
        device_address: Some(4),
        backend_path: Some("mock:1-4".into()),
        backend_numeric_location: None,
    }
}

#[derive(Debug)]
pub(crate) struct MockBackend {
    engine: Arc<MockEngine>,
    hardware: Arc<Mutex<Hardware>>,
}

impl MockBackend {
    pub(crate) fn new() -> (Self, MockHandle) {
        let (events, receiver) = mpsc::channel();
        let engine = Arc::new(MockEngine {
            index: TransferIndex::new(),
            events: Mutex::new(receiver),
            thread: Mutex::new(None),
        });
        let hardware = Arc::new(Mutex::new(Hardware::new(events)));

        let handle = MockHandle {
            engine: Arc::clone(&engine),
            hardware: Arc::clone(&hardware),
        };
        (MockBackend { engine, hardware }, handle)
    }
}

impl Backend for MockBackend {
    fn get_devices(&self) -> UsbResult<Vec<DeviceInformation>> {
        check_thread(&self.engine.thread)?;
        Ok(vec![mock_information()])
    }

    fn open(&self, information: &DeviceInformation) -> UsbResult<Box<dyn BackendDevice>> {
        if information.backend_path != mock_information().backend_path {
            return Err(Error::DeviceNotFound);
        }
        self.engine.ensure_started()?;

        Ok(Box::new(MockDevice {
            engine: Arc::clone(&self.engine),
            hardware: Arc::clone(&self.hardware),
            owner: self.engine.index.register_owner(),
            open: true,
            device_descriptor: sample_device_descriptor(),
            configuration_descriptor: sample_configuration(),
        }))
    }
}

/// The test's side of the mock: scripts the device and inspects what happened to it.
#[derive(Clone, Debug)]
pub(crate) struct MockHandle {
    engine: Arc<MockEngine>,
    hardware: Arc<Mutex<Hardware>>,
}

impl MockHandle {
    pub(crate) fn hardware(&self) -> MutexGuard<'_, Hardware> {
        lock(&self.hardware)
    }

    /// The device sends one packet on an IN endpoint.
    pub(crate) fn feed(&self, address: u8, data: &[u8]) {
        self.hardware().deliver(address, Reply::Data(data.to_vec()));
    }

    /// The device answers the next IN transfer on an endpoint with an error status.
    pub(crate) fn feed_status(&self, address: u8, status: i64) {
        self.hardware().deliver(address, Reply::Status(status));
    }

    /// Like [MockHandle::feed], but only if a transfer is already waiting for the data.
    pub(crate) fn feed_if_waiting(&self, address: u8, data: &[u8]) -> bool {
        let mut hardware = self.hardware();
        if hardware.waiting_on(address) == 0 {
            return false;
        }
        hardware.deliver(address, Reply::Data(data.to_vec()));
        true
    }

    pub(crate) fn set_control_response(&self, data: &[u8]) {
        self.hardware().control_response = data.to_vec();
    }

    pub(crate) fn fail_next_control(&self, status: i64) {
        self.hardware().control_status.push_back(status);
    }

    pub(crate) fn fail_next_out(&self, status: i64) {
        self.hardware().out_status.push_back(status);
    }

    /// While set, OUT transfers stay pending until released one by one.
    pub(crate) fn hold_out(&self, hold: bool) {
        self.hardware().hold_out = hold;
    }

    /// While set, control requests stay pending until aborted.
    pub(crate) fn hold_control(&self, hold: bool) {
        self.hardware().hold_control = hold;
    }

    /// Makes every abort fail with `code`, leaving the transfers pending.
    pub(crate) fn fail_aborts(&self, code: i64) {
        self.hardware().abort_failure = Some(code);
    }

    /// Completes every transfer waiting on an endpoint with `status`.
    pub(crate) fn complete_waiting(&self, address: u8, status: i64) {
        let mut hardware = self.hardware();
        for (id, _) in hardware.waiting.remove(&address).unwrap_or_default() {
            hardware.post(MockEvent::done(id, status, 0));
        }
    }

    /// Lets the device accept the oldest held OUT transfer on an endpoint.
    pub(crate) fn release_out(&self, address: u8) -> bool {
        let mut hardware = self.hardware();
        match hardware.waiting.get_mut(&address).and_then(VecDeque::pop_front) {
            Some((id, length)) => {
                hardware.post(MockEvent::done(id, 0, length));
                true
            }
            None => false,
        }
    }

    /// Transfers the engine still considers in flight, across every mock device.
    pub(crate) fn pending(&self) -> usize {
        self.engine.index.pending_total()
    }

    /// Polls the hardware state until `condition` holds; panics after a few seconds.
    pub(crate) fn wait_for(&self, condition: impl Fn(&Hardware) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition(&self.hardware()) {
            assert!(Instant::now() < deadline, "mock hardware never reached expected state");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Opens the mock device through a [Host], the way an application would.
pub(crate) fn open_mock_device() -> (Device, MockHandle) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (backend, handle) = MockBackend::new();
    let host = Host::new_from_backend(Arc::new(backend)).unwrap();

    let selector = DeviceSelector {
        vendor_id: Some(0x1209),
        ..Default::default()
    };
    let information = host.device(&selector).unwrap();
    let device = host.open(&information).unwrap();

    (device, handle)
}
