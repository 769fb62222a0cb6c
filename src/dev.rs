//! Device-independent upper half of the CAN character driver.
//!
//! One [`CanDevice`] exists per controller. Three kinds of actor touch it:
//! user threads (through a [`CanFile`] handle), the controller's interrupt
//! handlers (through the `receive`/`txdone`/`txready` upcalls), and, with
//! the `txready` feature, the deferred-work thread running the transmit
//! pump. A single per-device lock plays the role the interrupt-disabled
//! critical section plays on a flat kernel: it covers every FIFO, counter
//! and table mutation, including the decision to wake a sleeper, so a
//! wake-up can never be missed. Blocking paths park on condition variables
//! and re-check their predicate on every wake.

use std::sync::{Arc, Condvar, Mutex};
#[cfg(feature = "txready")]
use std::sync::Weak;
use std::thread;
use std::time::Duration;

use embedded_can::Id;
use log::{debug, error, trace};

use crate::error::Error;
#[cfg(feature = "errors")]
use crate::error::ErrorFlags;
use crate::frame::{self, CanFrame, CanHeader};
use crate::lower::{LowerHalf, TxDone};
use crate::queue::{RxFifo, TxFifo};
use crate::rtr::RtrTable;
#[cfg(feature = "txready")]
use crate::work::WorkQueue;

/// Granularity of the close-time drain polls.
const DRAIN_POLL: Duration = Duration::from_millis(500);

bitflags::bitflags! {
    /// Per-open-file flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Read and write return `WouldBlock` instead of sleeping.
        const NONBLOCK = 1 << 0;
    }
}

/// Argument block for [`Ioctl::RtrRead`]: the id to solicit and the buffer
/// the response lands in.
pub struct RtrRequest<'a> {
    pub id: Id,
    pub msg: &'a mut CanFrame,
}

/// Control requests accepted by [`CanFile::ioctl`].
pub enum Ioctl<'a> {
    /// Send a remote transmission request and block until the matching
    /// response arrives, delivered into the request's buffer.
    RtrRead(RtrRequest<'a>),
    /// Anything else is the lower half's business and passes through
    /// verbatim.
    Device { cmd: u32, arg: usize },
}

struct DevState<L, const FIFO_SIZE: usize, const NRTR: usize> {
    lower: L,
    xmit: TxFifo<FIFO_SIZE>,
    recv: RxFifo<FIFO_SIZE>,
    rtr: RtrTable<NRTR>,
    ocount: u8,
    ntxwaiters: u8,
    nrxwaiters: u8,
    #[cfg(feature = "errors")]
    error: ErrorFlags,
    #[cfg(feature = "txready")]
    work_queued: bool,
}

/// Upper-half state for one CAN controller.
///
/// `FIFO_SIZE` is the ring capacity of both software FIFOs (usable depth is
/// one less); `NRTR` is the size of the RTR rendezvous table.
pub struct CanDevice<L: LowerHalf + 'static, const FIFO_SIZE: usize = 8, const NRTR: usize = 4> {
    state: Mutex<DevState<L, FIFO_SIZE, NRTR>>,
    rx_wait: Condvar,
    tx_wait: Condvar,
    rtr_wait: [Condvar; NRTR],
    /// Serializes first-open bring-up against last-close teardown.
    close_gate: Mutex<()>,
    #[cfg(feature = "txready")]
    work: Arc<WorkQueue>,
    /// Back-reference for handing the device to the deferred pump.
    #[cfg(feature = "txready")]
    myself: Weak<Self>,
}

/// One open handle on a [`CanDevice`], the equivalent of a file descriptor.
///
/// Dropping the handle closes it; the last close drains both transmit FIFOs
/// and shuts the controller down.
pub struct CanFile<L: LowerHalf + 'static, const FIFO_SIZE: usize = 8, const NRTR: usize = 4> {
    dev: Arc<CanDevice<L, FIFO_SIZE, NRTR>>,
    flags: OpenFlags,
}

impl<L, const FIFO_SIZE: usize, const NRTR: usize> CanDevice<L, FIFO_SIZE, NRTR>
where
    L: LowerHalf + 'static,
{
    fn new_state(lower: L) -> DevState<L, FIFO_SIZE, NRTR> {
        DevState {
            lower,
            xmit: TxFifo::new(),
            recv: RxFifo::new(),
            rtr: RtrTable::new(),
            ocount: 0,
            ntxwaiters: 0,
            nrxwaiters: 0,
            #[cfg(feature = "errors")]
            error: ErrorFlags::empty(),
            #[cfg(feature = "txready")]
            work_queued: false,
        }
    }

    /// Initialize a device around `lower` and reset the controller.
    ///
    /// The returned handle is what a registration layer would publish at a
    /// device path; callers obtain per-open handles with [`Self::open`].
    #[cfg(feature = "txready")]
    pub fn register(mut lower: L, work: &Arc<WorkQueue>) -> Arc<Self> {
        assert!(FIFO_SIZE >= 2);
        debug!("registering CAN device");
        lower.reset();
        Arc::new_cyclic(|myself| Self {
            state: Mutex::new(Self::new_state(lower)),
            rx_wait: Condvar::new(),
            tx_wait: Condvar::new(),
            rtr_wait: std::array::from_fn(|_| Condvar::new()),
            close_gate: Mutex::new(()),
            work: Arc::clone(work),
            myself: myself.clone(),
        })
    }

    /// Initialize a device around `lower` and reset the controller.
    ///
    /// The returned handle is what a registration layer would publish at a
    /// device path; callers obtain per-open handles with [`Self::open`].
    #[cfg(not(feature = "txready"))]
    pub fn register(mut lower: L) -> Arc<Self> {
        assert!(FIFO_SIZE >= 2);
        debug!("registering CAN device");
        lower.reset();
        Arc::new(Self {
            state: Mutex::new(Self::new_state(lower)),
            rx_wait: Condvar::new(),
            tx_wait: Condvar::new(),
            rtr_wait: std::array::from_fn(|_| Condvar::new()),
            close_gate: Mutex::new(()),
        })
    }

    /// Open the device. The first opener brings the hardware up.
    pub fn open(self: &Arc<Self>, flags: OpenFlags) -> Result<CanFile<L, FIFO_SIZE, NRTR>, Error> {
        // A close in progress must finish tearing down before the count is
        // examined.
        let _gate = self.close_gate.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        debug!("open: ocount: {}", st.ocount);

        let count = st.ocount.checked_add(1).ok_or(Error::TooManyOpens)?;
        if count == 1 {
            // First open: bring the hardware up before the count advances,
            // so a failed setup leaves the device closed.
            st.lower.setup()?;
            st.xmit.reset();
            st.recv.reset();
            st.lower.rxint(true);
        }
        st.ocount = count;
        Ok(CanFile {
            dev: Arc::clone(self),
            flags,
        })
    }

    fn close_inner(&self) {
        let _gate = self.close_gate.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        debug!("close: ocount: {}", st.ocount);

        if st.ocount > 1 {
            st.ocount -= 1;
            return;
        }
        st.ocount = 0;

        // Stop accepting input.
        st.lower.rxint(false);
        drop(st);

        // Drain the software FIFO, then the hardware pipeline. Close is not
        // performance-critical; sleeping hands the CPU to whatever path is
        // doing the draining.
        loop {
            let st = self.state.lock().unwrap();
            if st.xmit.is_empty() {
                break;
            }
            drop(st);
            thread::sleep(DRAIN_POLL);
        }
        loop {
            let st = self.state.lock().unwrap();
            if st.lower.txempty() {
                break;
            }
            drop(st);
            thread::sleep(DRAIN_POLL);
        }

        let mut st = self.state.lock().unwrap();
        st.lower.shutdown();
    }

    /// Frames accepted by `write` and not yet completed by the hardware.
    pub fn tx_pending(&self) -> usize {
        self.state.lock().unwrap().xmit.len()
    }

    /// Frames waiting in the receive FIFO.
    pub fn rx_available(&self) -> usize {
        self.state.lock().unwrap().recv.len()
    }

    fn read(&self, buf: &mut [u8], flags: OpenFlags) -> Result<usize, Error> {
        debug!("read: buflen: {}", buf.len());

        // The caller must be able to take at least the smallest message; an
        // undersized buffer reads zero bytes rather than erroring.
        if buf.len() < frame::msg_len(0) {
            return Ok(0);
        }

        let mut st = self.state.lock().unwrap();

        #[cfg(feature = "errors")]
        if !st.error.is_empty() {
            // A driver error is latched: deliver it as a synthesized error
            // frame ahead of any data, clearing the latch.
            if buf.len() < frame::msg_len(frame::CAN_ERROR_DLC as usize) {
                return Ok(0);
            }
            let msg = frame::error_frame(st.error);
            st.error = ErrorFlags::empty();
            return Ok(msg.encode(buf));
        }

        if st.recv.is_empty() {
            if flags.contains(OpenFlags::NONBLOCK) {
                return Err(Error::WouldBlock);
            }
            st.nrxwaiters += 1;
            while st.recv.is_empty() {
                st = self.rx_wait.wait(st).unwrap();
            }
            st.nrxwaiters -= 1;
        }

        // Copy out consecutive frames until the next one would not fit.
        let mut nread = 0;
        while let Some(msg) = st.recv.peek() {
            let msglen = msg.wire_len();
            if nread + msglen > buf.len() {
                break;
            }
            msg.encode(&mut buf[nread..nread + msglen]);
            nread += msglen;
            st.recv.advance();
        }
        Ok(nread)
    }

    fn write(&self, buf: &[u8], flags: OpenFlags) -> Result<usize, Error> {
        debug!("write: buflen: {}", buf.len());

        let mut nsent = 0;
        let mut st = self.state.lock().unwrap();

        // If the TX side is idle there is no completion interrupt on the
        // way, so the hardware will need a kick from this thread once the
        // FIFO has content.
        let mut inactive = st.lower.txempty();

        // Trailing bytes shorter than the smallest message are ignored.
        while buf.len() - nsent >= frame::msg_len(0) {
            let msg = match CanFrame::decode(&buf[nsent..]) {
                Ok(msg) => msg,
                Err(e) => {
                    if nsent == 0 {
                        return Err(e);
                    }
                    // A malformed tail ends the parse; the frames already
                    // queued still go out.
                    break;
                }
            };
            let msglen = msg.wire_len();

            while st.xmit.is_full() {
                if flags.contains(OpenFlags::NONBLOCK) {
                    return if nsent == 0 {
                        Err(Error::WouldBlock)
                    } else {
                        Ok(nsent)
                    };
                }

                // An idle transmitter will never interrupt; prime it so the
                // FIFO can drain while we sleep.
                if inactive {
                    let _ = self.xmit(&mut st);
                }

                debug_assert!(st.ntxwaiters < u8::MAX);
                st.ntxwaiters += 1;
                while st.xmit.is_full() {
                    st = self.tx_wait.wait(st).unwrap();
                }
                st.ntxwaiters -= 1;

                inactive = st.lower.txempty();
            }

            st.xmit.push(msg);
            nsent += msglen;
        }

        if inactive {
            let _ = self.xmit(&mut st);
        }
        Ok(nsent)
    }

    /// Hand queued frames to the controller while it will take them.
    ///
    /// Call with the device lock held. Completions the controller reports
    /// through the [`TxDone`] context are applied here, immediately after
    /// the send that produced them; the loop itself then pumps whatever
    /// frames remain, which is also what retires the backlog after a
    /// completion arrives from interrupt context via [`Self::txdone`].
    fn xmit(&self, st: &mut DevState<L, FIFO_SIZE, NRTR>) -> Result<(), Error> {
        let (head, queue, tail) = st.xmit.indices();
        trace!("xmit head: {} queue: {} tail: {}", head, queue, tail);

        if st.xmit.is_empty() {
            debug_assert_eq!(queue, head);
            // With no hardware FIFO there is nothing left to complete, so
            // TX interrupts can be quieted. With one, they stay as they are
            // until the hardware itself drains.
            #[cfg(not(feature = "txready"))]
            st.lower.txint(false);
            return Err(Error::Empty);
        }

        let mut ret = Err(Error::Busy);
        while !st.xmit.all_queued() && st.lower.txready() {
            debug_assert!(!st.xmit.is_empty());

            // Advance the hand-off cursor before touching the controller:
            // the completion a synchronous send reports must never overtake
            // it.
            let DevState { xmit, lower, .. } = &mut *st;
            let msg = xmit.queue_next();
            let mut done = TxDone::new();
            let sent = lower.send(msg, &mut done);

            for _ in 0..done.take() {
                st.xmit.complete();
                if st.ntxwaiters > 0 {
                    self.tx_wait.notify_one();
                }
            }

            match sent {
                Ok(()) => ret = Ok(()),
                Err(nb::Error::WouldBlock) => {
                    ret = Err(Error::Busy);
                    break;
                }
                Err(nb::Error::Other(e)) => {
                    error!("lower-half send failed: {}", e);
                    ret = Err(e);
                    break;
                }
            }
        }

        // TX interrupts stay enabled while completions are outstanding.
        st.lower.txint(true);
        ret
    }

    /// One previously handed-off frame has completed.
    ///
    /// Upcall from the controller's interrupt handler for asynchronous
    /// completions; synchronous ones use the [`TxDone`] context passed to
    /// `send`. Retires the oldest handed-off frame, pumps the next, and
    /// wakes one blocked writer.
    pub fn txdone(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        let (head, queue, tail) = st.xmit.indices();
        trace!("txdone head: {} queue: {} tail: {}", head, queue, tail);

        if st.xmit.is_empty() {
            return Err(Error::Empty);
        }
        st.xmit.complete();
        let _ = self.xmit(&mut st);
        if st.ntxwaiters > 0 {
            self.tx_wait.notify_one();
        }
        Ok(())
    }

    /// The hardware TX FIFO has room again.
    ///
    /// Upcall from the interrupt handler, meaningful only for controllers
    /// with their own TX FIFO. Schedules the deferred pump; pumping may wake
    /// blocked writers, which is not legal work at interrupt level.
    #[cfg(feature = "txready")]
    pub fn txready(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        let (head, queue, tail) = st.xmit.indices();
        trace!(
            "txready head: {} queue: {} tail: {} waiters: {}",
            head,
            queue,
            tail,
            st.ntxwaiters
        );

        if st.xmit.is_empty() {
            // Writers can still be counted here: a waiter woken by the
            // final completion may not have decremented the count yet, so
            // no assertion on ntxwaiters.
            return Err(Error::Empty);
        }
        if st.work_queued {
            // The queued pump will observe this state when it runs.
            return Err(Error::Busy);
        }
        st.work_queued = true;
        drop(st);

        // The pump holds only a weak reference; a device mid-teardown when
        // the job runs is simply left alone.
        let myself = self.myself.clone();
        match self.work.queue(Box::new(move || {
            if let Some(dev) = myself.upgrade() {
                dev.txready_work();
            }
        })) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().unwrap().work_queued = false;
                Err(e)
            }
        }
    }

    /// Deferred half of [`Self::txready`], on the worker thread.
    #[cfg(feature = "txready")]
    fn txready_work(self: Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        st.work_queued = false;
        let (head, queue, tail) = st.xmit.indices();
        trace!("txready_work head: {} queue: {} tail: {}", head, queue, tail);

        if !st.xmit.is_empty() {
            // If a frame was handed off there is new space in the software
            // FIFO for a blocked writer.
            if self.xmit(&mut st).is_ok() && st.ntxwaiters > 0 {
                self.tx_wait.notify_one();
            }
        }
    }

    /// Deliver one frame arriving from the wire.
    ///
    /// Upcall from the controller's receive interrupt. RTR waiters matching
    /// the id are served first and unconditionally, even when the RX FIFO
    /// is full.
    pub fn receive(&self, hdr: &CanHeader, data: &[u8]) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        trace!("receive id: {:#x} dlc: {}", frame::id_raw(hdr.id), hdr.dlc);

        st.rtr
            .deliver(hdr, data, |ndx| self.rtr_wait[ndx].notify_one());

        if st.recv.is_full() {
            #[cfg(feature = "errors")]
            {
                st.error |= ErrorFlags::RX_OVERFLOW;
            }
            return Err(Error::OutOfMemory);
        }
        st.recv.push(CanFrame::from_parts(*hdr, data));
        if st.nrxwaiters > 0 {
            self.rx_wait.notify_one();
        }
        Ok(())
    }

    /// Send a remote request and wait for the matching response.
    fn rtr_read(&self, id: Id) -> Result<CanFrame, Error> {
        let mut st = self.state.lock().unwrap();
        let ndx = st.rtr.claim(id).ok_or(Error::OutOfMemory)?;

        match st.lower.remote_request(id) {
            Ok(()) => loop {
                if let Some(msg) = st.rtr.take_ready(ndx) {
                    return Ok(msg);
                }
                st = self.rtr_wait[ndx].wait(st).unwrap();
            },
            Err(e) => {
                // A failed request must not strand the slot: occupied means
                // a waiter owns it.
                st.rtr.release(ndx);
                Err(e)
            }
        }
    }
}

impl<L, const FIFO_SIZE: usize, const NRTR: usize> CanFile<L, FIFO_SIZE, NRTR>
where
    L: LowerHalf + 'static,
{
    /// Read buffered frames, packed back to back.
    ///
    /// Blocks until at least one frame is available unless the handle is
    /// non-blocking. A buffer smaller than the smallest message reads zero
    /// bytes. While a driver error is latched, the first sufficient read
    /// returns a synthesized error frame instead of data.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.dev.read(buf, self.flags)
    }

    /// Queue the frames packed in `buf` for transmission, in order.
    ///
    /// Returns the bytes consumed, always a whole number of frames. Blocks
    /// for FIFO space unless the handle is non-blocking, in which case a
    /// full FIFO yields `WouldBlock` (nothing consumed) or a short count.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.dev.write(buf, self.flags)
    }

    /// Control requests: RTR rendezvous here, everything else passed to the
    /// lower half.
    pub fn ioctl(&self, req: Ioctl<'_>) -> Result<i32, Error> {
        match req {
            Ioctl::RtrRead(req) => {
                *req.msg = self.dev.rtr_read(req.id)?;
                Ok(0)
            }
            Ioctl::Device { cmd, arg } => {
                debug!("ioctl cmd: {:#x} arg: {:#x}", cmd, arg);
                self.dev.state.lock().unwrap().lower.ioctl(cmd, arg)
            }
        }
    }

    /// The device this handle opens.
    pub fn device(&self) -> &Arc<CanDevice<L, FIFO_SIZE, NRTR>> {
        &self.dev
    }

    /// Close the handle. Equivalent to dropping it; the last close drains
    /// the transmit path and shuts the controller down.
    pub fn close(self) {}
}

impl<L, const FIFO_SIZE: usize, const NRTR: usize> Drop for CanFile<L, FIFO_SIZE, NRTR>
where
    L: LowerHalf + 'static,
{
    fn drop(&mut self) {
        self.dev.close_inner();
    }
}
