//! Decoded frame ring buffer
//!
//! Fixed-capacity ring of decoded units between a decode worker (single
//! writer) and the presentation side (single reader). With "keep last"
//! enabled the most recently shown unit stays addressable through
//! [`FrameQueue::peek_last`] so it can be redrawn without being consumed
//! twice. Slots are reused in place; a displaced buffer is handed back to
//! the writer for recycling.

use super::packet_queue::PacketQueue;
use super::unit::{DecodedUnit, FrameData, Geometry};
use super::StreamKind;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Copy of a slot's timing metadata
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    /// Physical slot index in the ring
    pub slot: usize,

    /// Presentation timestamp in seconds
    pub pts: Option<f64>,

    /// Estimated duration in seconds
    pub duration: f64,

    /// Epoch serial
    pub serial: u64,

    /// Byte position in the source
    pub pos: Option<i64>,

    /// Samples per channel (audio)
    pub samples: usize,

    /// Display window relative to `pts` (subtitles)
    pub window: Option<(f64, f64)>,
}

struct RingState {
    slots: Vec<Option<DecodedUnit>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

impl RingState {
    fn info(&self, slot: usize) -> Option<FrameInfo> {
        self.slots[slot].as_ref().map(|unit| FrameInfo {
            slot,
            pts: unit.pts,
            duration: unit.duration,
            serial: unit.serial,
            pos: unit.pos,
            samples: unit.sample_count(),
            window: match unit.geometry {
                Geometry::Subtitle { start, end } => Some((start, end)),
                _ => None,
            },
        })
    }

    fn remaining(&self) -> usize {
        self.size - self.rindex_shown
    }

    fn head_slot(&self, capacity: usize) -> usize {
        (self.rindex + self.rindex_shown) % capacity
    }
}

/// Decoded-unit queue
pub struct FrameQueue {
    kind: StreamKind,
    capacity: usize,
    keep_last: bool,

    /// Paired coded-unit queue; its abort flag also releases waiters here
    packets: Arc<PacketQueue>,

    state: Mutex<RingState>,
    cond: Condvar,
}

/// Exclusive access to the next empty slot, obtained from
/// [`FrameQueue::peek_writable`]
pub struct WriteSlot<'a> {
    queue: &'a FrameQueue,
}

impl<'a> WriteSlot<'a> {
    /// Store a unit in the slot and advance the write cursor
    ///
    /// Returns the buffer previously held by the slot, if any.
    pub fn push(self, unit: DecodedUnit) -> Option<FrameData> {
        let queue = self.queue;
        let mut state = queue.state.lock();
        let windex = state.windex;
        let displaced = state.slots[windex].replace(unit);
        state.windex = (windex + 1) % queue.capacity;
        state.size += 1;
        queue.cond.notify_all();
        displaced.map(|old| old.data)
    }
}

impl FrameQueue {
    /// Create a ring with `capacity` slots (at least one)
    pub fn new(kind: StreamKind, capacity: usize, keep_last: bool, packets: Arc<PacketQueue>) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            keep_last,
            packets,
            state: Mutex::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake every waiter so it re-checks the abort flag
    pub fn signal(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Wait for an empty slot; `None` once the paired packet queue is aborted
    pub fn peek_writable(&self) -> Option<WriteSlot<'_>> {
        let mut state = self.state.lock();
        while state.size >= self.capacity && !self.packets.is_aborted() {
            self.cond.wait(&mut state);
        }

        if self.packets.is_aborted() {
            return None;
        }
        Some(WriteSlot { queue: self })
    }

    /// Wait until the logical head is populated; `None` on abort
    pub fn peek_readable(&self) -> Option<FrameInfo> {
        let mut state = self.state.lock();
        while state.remaining() == 0 && !self.packets.is_aborted() {
            self.cond.wait(&mut state);
        }

        if self.packets.is_aborted() {
            return None;
        }
        let slot = state.head_slot(self.capacity);
        state.info(slot)
    }

    /// Logical read head, if populated
    pub fn peek(&self) -> Option<FrameInfo> {
        let state = self.state.lock();
        if state.remaining() == 0 {
            return None;
        }
        state.info(state.head_slot(self.capacity))
    }

    /// The unit after the read head, if populated
    pub fn peek_next(&self) -> Option<FrameInfo> {
        let state = self.state.lock();
        if state.remaining() < 2 {
            return None;
        }
        state.info((state.head_slot(self.capacity) + 1) % self.capacity)
    }

    /// The last shown unit (equals the head before anything was shown)
    pub fn peek_last(&self) -> Option<FrameInfo> {
        let state = self.state.lock();
        if state.size == 0 {
            return None;
        }
        state.info(state.rindex)
    }

    /// Advance the logical read head
    pub fn next(&self) {
        let mut state = self.state.lock();
        if state.size == 0 {
            return;
        }
        if self.keep_last && state.rindex_shown == 0 {
            state.rindex_shown = 1;
            return;
        }
        state.rindex = (state.rindex + 1) % self.capacity;
        state.size -= 1;
        self.cond.notify_all();
    }

    /// Units that are neither read nor shown
    pub fn remaining(&self) -> usize {
        self.state.lock().remaining()
    }

    /// Whether the last-shown slot holds a displayed unit
    pub fn has_shown(&self) -> bool {
        self.state.lock().rindex_shown == 1
    }

    /// Byte position of the last shown unit if it belongs to the current epoch
    pub fn last_pos(&self) -> Option<i64> {
        let state = self.state.lock();
        if state.rindex_shown == 0 {
            return None;
        }
        state.slots[state.rindex]
            .as_ref()
            .filter(|unit| unit.serial == self.packets.serial())
            .and_then(|unit| unit.pos)
    }

    /// Run `f` on the unit at the logical head
    pub fn with_head<R>(&self, f: impl FnOnce(&mut DecodedUnit) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if state.remaining() == 0 {
            return None;
        }
        let slot = state.head_slot(self.capacity);
        state.slots[slot].as_mut().map(f)
    }

    /// Run `f` on the last shown unit
    pub fn with_last<R>(&self, f: impl FnOnce(&mut DecodedUnit) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if state.size == 0 {
            return None;
        }
        let slot = state.rindex;
        state.slots[slot].as_mut().map(f)
    }

    /// Run `f` while holding the ring lock
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = self.state.lock();
        f()
    }
}
