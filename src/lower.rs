//! Contract between the upper half and a hardware-specific controller
//! driver.
//!
//! The upper half calls down through [`LowerHalf`]; the controller's
//! interrupt handlers call back up through [`crate::CanDevice::receive`],
//! [`crate::CanDevice::txdone`] and (with the `txready` feature)
//! [`crate::CanDevice::txready`].

use embedded_can::Id;

use crate::error::Error;
use crate::frame::CanFrame;

/// Completion context handed to [`LowerHalf::send`].
///
/// A controller that retires a frame while `send` is still on the stack (for
/// example one with its own TX FIFO that accepts the frame immediately)
/// reports that here; the transmit engine applies the completions as soon as
/// `send` returns. Completions signalled later, from the controller's
/// interrupt handler, go through [`crate::CanDevice::txdone`] instead.
#[derive(Debug, Default)]
pub struct TxDone {
    completed: u32,
}

impl TxDone {
    pub(crate) fn new() -> Self {
        Self { completed: 0 }
    }

    /// Record that one previously handed-off frame has completed.
    pub fn txdone(&mut self) {
        self.completed += 1;
    }

    pub(crate) fn take(&self) -> u32 {
        self.completed
    }
}

/// Operations a hardware adapter provides to the upper half.
///
/// All methods are invoked with the device lock held, so an implementation
/// never races against the FIFO state it is serving.
pub trait LowerHalf: Send {
    /// One-time hardware bring-up, on the first open.
    fn setup(&mut self) -> Result<(), Error>;

    /// Teardown on the last close, after both FIFOs have drained.
    fn shutdown(&mut self);

    /// Put the controller into a known state. Called once at registration.
    fn reset(&mut self);

    /// Enable or disable receive interrupts.
    fn rxint(&mut self, enable: bool);

    /// Enable or disable transmit interrupts.
    fn txint(&mut self, enable: bool);

    /// Will the controller accept another frame right now?
    fn txready(&self) -> bool;

    /// Has the controller's transmit pipeline fully drained?
    fn txempty(&self) -> bool;

    /// Hand one frame to the controller.
    ///
    /// Returns `WouldBlock` if the controller turned out to be busy after
    /// all. A frame retired before this call returns is reported through
    /// `done`; otherwise the completion is expected later via
    /// [`crate::CanDevice::txdone`], exactly once per accepted frame.
    fn send(&mut self, frame: &CanFrame, done: &mut TxDone) -> nb::Result<(), Error>;

    /// Emit a remote transmission request for `id`.
    fn remote_request(&mut self, id: Id) -> Result<(), Error>;

    /// Device-specific control requests forwarded from
    /// [`crate::CanFile::ioctl`].
    fn ioctl(&mut self, cmd: u32, arg: usize) -> Result<i32, Error> {
        let _ = (cmd, arg);
        Err(Error::NotSupported)
    }
}
