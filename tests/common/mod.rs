//! Shared test fixture: a recording mock controller the upper half drives.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use candev::{CanDevice, CanFrame, Error, Id, LowerHalf, StandardId, TxDone};

#[cfg(feature = "txready")]
use candev::WorkQueue;

/// Observable controller state, shared between the mock handed to the
/// device and the test body.
#[derive(Default)]
pub struct ControllerState {
    /// Frames the controller accepted, in hand-off order.
    pub sent: Vec<CanFrame>,
    /// Send calls including refused ones.
    pub send_attempts: usize,
    /// Ids of emitted remote transmission requests.
    pub remote_ids: Vec<Id>,
    /// Does the controller accept another frame right now?
    pub txready: bool,
    /// Is the controller's TX pipeline drained?
    pub txempty: bool,
    /// Retire each frame from inside `send` (a controller with its own
    /// TX FIFO behaves this way).
    pub sync_complete: bool,
    /// Make `send` fail with a hardware error.
    pub fail_sends: bool,
    /// Make `remote_request` fail.
    pub fail_remote: bool,
    /// Make `setup` fail.
    pub fail_setup: bool,
    pub setups: usize,
    pub shutdowns: usize,
    pub resets: usize,
    pub rxint: bool,
}

pub struct TestController {
    shared: Arc<Mutex<ControllerState>>,
}

impl TestController {
    pub fn new() -> (Self, Arc<Mutex<ControllerState>>) {
        let shared = Arc::new(Mutex::new(ControllerState {
            txready: true,
            txempty: true,
            ..Default::default()
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            shared,
        )
    }
}

impl LowerHalf for TestController {
    fn setup(&mut self) -> Result<(), Error> {
        let mut hw = self.shared.lock().unwrap();
        hw.setups += 1;
        if hw.fail_setup {
            Err(Error::Io)
        } else {
            Ok(())
        }
    }

    fn shutdown(&mut self) {
        self.shared.lock().unwrap().shutdowns += 1;
    }

    fn reset(&mut self) {
        self.shared.lock().unwrap().resets += 1;
    }

    fn rxint(&mut self, enable: bool) {
        self.shared.lock().unwrap().rxint = enable;
    }

    fn txint(&mut self, _enable: bool) {}

    fn txready(&self) -> bool {
        self.shared.lock().unwrap().txready
    }

    fn txempty(&self) -> bool {
        self.shared.lock().unwrap().txempty
    }

    fn send(&mut self, frame: &CanFrame, done: &mut TxDone) -> nb::Result<(), Error> {
        let mut hw = self.shared.lock().unwrap();
        hw.send_attempts += 1;
        if hw.fail_sends {
            return Err(nb::Error::Other(Error::Io));
        }
        hw.sent.push(*frame);
        if hw.sync_complete {
            done.txdone();
        }
        Ok(())
    }

    fn remote_request(&mut self, id: Id) -> Result<(), Error> {
        let mut hw = self.shared.lock().unwrap();
        if hw.fail_remote {
            return Err(Error::Io);
        }
        hw.remote_ids.push(id);
        Ok(())
    }
}

/// Register a device over a fresh mock controller.
#[cfg(feature = "txready")]
pub fn register<const FIFO_SIZE: usize, const NRTR: usize>(
) -> (Arc<CanDevice<TestController, FIFO_SIZE, NRTR>>, Arc<Mutex<ControllerState>>) {
    let (lower, hw) = TestController::new();
    let work = Arc::new(WorkQueue::new("canwork"));
    (CanDevice::register(lower, &work), hw)
}

/// Register a device over a fresh mock controller.
#[cfg(not(feature = "txready"))]
pub fn register<const FIFO_SIZE: usize, const NRTR: usize>(
) -> (Arc<CanDevice<TestController, FIFO_SIZE, NRTR>>, Arc<Mutex<ControllerState>>) {
    let (lower, hw) = TestController::new();
    (CanDevice::register(lower), hw)
}

pub fn sid(raw: u16) -> Id {
    Id::Standard(StandardId::new(raw).unwrap())
}

pub fn frame(raw: u16, data: &[u8]) -> CanFrame {
    CanFrame::new(sid(raw), data).unwrap()
}

/// Pack frames back to back the way a user buffer carries them.
pub fn encode_frames(frames: &[CanFrame]) -> Vec<u8> {
    let total = frames.iter().map(CanFrame::wire_len).sum();
    let mut buf = vec![0u8; total];
    let mut off = 0;
    for frame in frames {
        off += frame.encode(&mut buf[off..]);
    }
    buf
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}
