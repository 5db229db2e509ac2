//! Thread-safe FIFO of coded units for one elementary stream
//!
//! The queue carries an epoch serial. Enqueuing a flush marker bumps the
//! serial, and every unit is stamped with the serial current at the time it
//! was enqueued, so consumers can tell pre-flush data from post-flush data.

use super::unit::{CodedUnit, TimeBase, UNIT_OVERHEAD_BYTES};
use super::StreamKind;
use crate::sync::SerialSource;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Outcome of a dequeue attempt
#[derive(Debug, PartialEq)]
pub enum Dequeue {
    /// The queue is in abort state
    Aborted,
    /// Non-blocking call on an empty queue
    Empty,
    /// A unit and the serial it was enqueued under
    Got(CodedUnit, u64),
}

/// Snapshot of queue accounting, used for buffering decisions
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    /// Number of queued units
    pub packets: usize,

    /// Payload bytes plus a fixed per-unit overhead
    pub bytes: usize,

    /// Summed unit durations in stream ticks
    pub duration_ticks: i64,

    /// Seconds per duration tick
    pub seconds_per_tick: f64,
}

impl QueueStats {
    /// Queued duration in seconds, `None` when no unit carried a duration
    pub fn duration_secs(&self) -> Option<f64> {
        if self.duration_ticks == 0 {
            None
        } else {
            Some(self.duration_ticks as f64 * self.seconds_per_tick)
        }
    }
}

struct QueueState {
    units: VecDeque<CodedUnit>,
    bytes: usize,
    duration_ticks: i64,
    abort: bool,
    serial: u64,
}

/// Coded-unit queue
pub struct PacketQueue {
    kind: StreamKind,
    time_base: TimeBase,
    state: Mutex<QueueState>,
    cond: Condvar,

    /// Lock-free mirrors of `state.serial` / `state.abort`, written under the lock
    serial: AtomicU64,
    aborted: AtomicBool,
}

impl PacketQueue {
    /// Create a queue in abort state; call [`start`](Self::start) before use
    pub fn new(kind: StreamKind, time_base: TimeBase) -> Self {
        Self {
            kind,
            time_base,
            state: Mutex::new(QueueState {
                units: VecDeque::new(),
                bytes: 0,
                duration_ticks: 0,
                abort: true,
                serial: 0,
            }),
            cond: Condvar::new(),
            serial: AtomicU64::new(0),
            aborted: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// Enqueue a unit, transferring ownership to the queue
    ///
    /// Returns the unit back when the queue is aborted; the caller then owns
    /// and releases it.
    pub fn put(&self, mut unit: CodedUnit) -> Result<(), CodedUnit> {
        let mut state = self.state.lock();
        if state.abort {
            return Err(unit);
        }

        if unit.is_flush() {
            state.serial += 1;
            self.serial.store(state.serial, Ordering::Release);
            debug!("{} queue entering epoch {}", self.kind, state.serial);
        }
        unit.serial = state.serial;

        state.bytes += unit.payload_len() + UNIT_OVERHEAD_BYTES;
        state.duration_ticks += unit.duration.unwrap_or(0);
        state.units.push_back(unit);

        self.cond.notify_one();
        Ok(())
    }

    /// Enqueue an end-of-stream marker
    pub fn put_end_marker(&self, stream: StreamKind) -> Result<(), CodedUnit> {
        self.put(CodedUnit::end_marker(stream))
    }

    /// Dequeue the oldest unit, optionally waiting for one to arrive
    pub fn get(&self, block: bool) -> Dequeue {
        let mut state = self.state.lock();
        loop {
            if state.abort {
                return Dequeue::Aborted;
            }

            if let Some(unit) = state.units.pop_front() {
                state.bytes = state
                    .bytes
                    .saturating_sub(unit.payload_len() + UNIT_OVERHEAD_BYTES);
                state.duration_ticks -= unit.duration.unwrap_or(0);
                let serial = unit.serial;
                return Dequeue::Got(unit, serial);
            }

            if !block {
                return Dequeue::Empty;
            }

            self.cond.wait(&mut state);
        }
    }

    /// Drop all queued units and zero the accounting; the serial is kept
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let dropped = state.units.len();
        state.units.clear();
        state.bytes = 0;
        state.duration_ticks = 0;
        if dropped > 0 {
            debug!("{} queue flushed {} units", self.kind, dropped);
        }
    }

    /// Enter abort state and wake every waiter
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.abort = true;
        self.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Leave abort state and open a fresh epoch
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            state.abort = false;
            self.aborted.store(false, Ordering::Release);
            self.cond.notify_all();
        }
        // Cannot fail: abort was just cleared and only `abort()` sets it again.
        let _ = self.put(CodedUnit::flush_marker(self.kind));
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Current epoch serial
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.state.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            packets: state.units.len(),
            bytes: state.bytes,
            duration_ticks: state.duration_ticks,
            seconds_per_tick: self.time_base.seconds_per_tick(),
        }
    }
}

impl SerialSource for PacketQueue {
    fn current_serial(&self) -> u64 {
        self.serial()
    }
}
