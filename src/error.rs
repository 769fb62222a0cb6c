//! Error taxonomy of the driver surface.

use core::fmt;

/// Error produced by the upper half or propagated from a lower half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Non-blocking handle and the FIFO cannot make progress right now.
    WouldBlock,
    /// The 8-bit open count would overflow.
    TooManyOpens,
    /// No free RTR slot, or the RX FIFO refused a frame.
    OutOfMemory,
    /// The controller (or the deferred transmit pump) is already occupied.
    Busy,
    /// Internal "FIFO empty" signal. Never escapes the public surface.
    Empty,
    /// A wait was interrupted. Waits treat this as spurious and re-loop.
    Interrupted,
    /// A user-supplied buffer did not parse as CAN frames.
    InvalidInput,
    /// The lower half does not recognize the request.
    NotSupported,
    /// The lower half reported a hardware failure.
    Io,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "operation would block"),
            Error::TooManyOpens => write!(f, "too many opens of this device"),
            Error::OutOfMemory => write!(f, "no buffer space available"),
            Error::Busy => write!(f, "device or work queue busy"),
            Error::Empty => write!(f, "transmit FIFO empty"),
            Error::Interrupted => write!(f, "wait interrupted"),
            Error::InvalidInput => write!(f, "malformed CAN frame"),
            Error::NotSupported => write!(f, "request not supported"),
            Error::Io => write!(f, "hardware I/O failure"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(feature = "errors")]
bitflags::bitflags! {
    /// Sticky driver-error byte.
    ///
    /// Latched by interrupt-context paths, OR'd across events, and delivered
    /// once through a synthesized error frame on the next `read`, which
    /// clears the latch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorFlags: u8 {
        /// A frame arrived while the RX FIFO was full and was dropped.
        const RX_OVERFLOW = 1 << 0;
    }
}
