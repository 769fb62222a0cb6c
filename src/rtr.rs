//! Rendezvous table for outstanding remote transmission requests.
//!
//! An RTR read is a send-wait-receive: the caller emits a remote request,
//! parks on a slot, and the receive interrupt completes the slot when a
//! frame with the matching id arrives. Several waiters may watch the same
//! id; one frame satisfies all of them.

use embedded_can::Id;

use crate::frame::{CanFrame, CanHeader};

/// One rendezvous slot. A slot is occupied exactly while a waiter owns it.
#[derive(Clone, Copy)]
enum RtrSlot {
    Free,
    /// A waiter has issued a remote request for this id.
    Waiting(Id),
    /// A matching frame arrived; the waiter has not collected it yet.
    Ready(CanFrame),
}

pub(crate) struct RtrTable<const N: usize> {
    slots: [RtrSlot; N],
    /// Occupied slot count, for the O(1) skip in the receive path.
    pending: u8,
}

impl<const N: usize> RtrTable<N> {
    pub fn new() -> Self {
        Self {
            slots: [RtrSlot::Free; N],
            pending: 0,
        }
    }

    pub fn pending(&self) -> u8 {
        self.pending
    }

    /// Occupy a free slot for `id`. The availability test is on the slot
    /// itself, never on the request being placed.
    pub fn claim(&mut self, id: Id) -> Option<usize> {
        for (ndx, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, RtrSlot::Free) {
                *slot = RtrSlot::Waiting(id);
                self.pending += 1;
                return Some(ndx);
            }
        }
        None
    }

    /// Release a slot whose waiter is giving up before delivery.
    pub fn release(&mut self, ndx: usize) {
        if matches!(self.slots[ndx], RtrSlot::Waiting(_)) {
            self.pending -= 1;
        }
        self.slots[ndx] = RtrSlot::Free;
    }

    /// Collect a delivered frame, freeing the slot.
    pub fn take_ready(&mut self, ndx: usize) -> Option<CanFrame> {
        if let RtrSlot::Ready(frame) = self.slots[ndx] {
            self.slots[ndx] = RtrSlot::Free;
            Some(frame)
        } else {
            None
        }
    }

    /// Hand `hdr`/`data` to every waiter whose id matches, invoking `wake`
    /// with each completed slot index. Each slot keeps its own copy state,
    /// so a multi-slot match can neither skip nor re-match a slot.
    pub fn deliver(&mut self, hdr: &CanHeader, data: &[u8], mut wake: impl FnMut(usize)) {
        if self.pending == 0 {
            return;
        }
        for (ndx, slot) in self.slots.iter_mut().enumerate() {
            if let RtrSlot::Waiting(id) = slot {
                if *id == hdr.id {
                    *slot = RtrSlot::Ready(CanFrame::from_parts(*hdr, data));
                    self.pending -= 1;
                    wake(ndx);
                }
            }
        }
    }
}
