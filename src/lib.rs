//! Device-independent upper half of a CAN character device driver.
//!
//! The upper half owns the software transmit/receive FIFOs, the RTR
//! rendezvous table and the open/close lifecycle; a hardware-specific
//! [`LowerHalf`] adapter drives the controller itself. User code talks to a
//! [`CanFile`] handle with `read`/`write`/`ioctl`; the adapter's interrupt
//! handlers feed [`CanDevice::receive`], [`CanDevice::txdone`] and, for
//! controllers with their own TX FIFO, [`CanDevice::txready`].
//!
//! Frames cross the byte-stream boundary in the packed wire form described
//! in [`frame`]: a 5-byte header followed by the payload, self-delimiting,
//! so one `write` can carry several frames back to back.

pub mod dev;
pub mod error;
pub mod frame;
pub mod lower;
mod queue;
mod rtr;
#[cfg(feature = "txready")]
pub mod work;

pub use dev::{CanDevice, CanFile, Ioctl, OpenFlags, RtrRequest};
pub use error::Error;
#[cfg(feature = "errors")]
pub use error::ErrorFlags;
pub use frame::{bytes_to_dlc, dlc_to_bytes, msg_len, CanFrame, CanHeader};
pub use lower::{LowerHalf, TxDone};
#[cfg(feature = "txready")]
pub use work::WorkQueue;

// Re-export the id vocabulary so adapters and callers need not name the
// underlying crate.
pub use embedded_can;
pub use embedded_can::{Id, StandardId};

#[cfg(feature = "extid")]
pub use embedded_can::ExtendedId;
