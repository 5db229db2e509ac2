//! Decode worker
//!
//! One worker per elementary stream pulls coded units from its
//! [`PacketQueue`], drives the [`Codec`] with send/receive backpressure and
//! delivers decoded units into the stream's [`FrameQueue`]. Epoch changes
//! arrive in-band as flush markers; everything from an older epoch is
//! discarded before it reaches the codec.

use super::frame_queue::FrameQueue;
use super::packet_queue::{Dequeue, PacketQueue};
use super::timing::MediaTiming;
use super::unit::{CodedUnit, DecodedUnit};
use super::{Codec, CodecFailure, RawFrame, ReceiveStatus, SendStatus, StreamKind};
use crate::utils::error::{Result, SyncError};
use log::{debug, error, info, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of a single [`DecodeWorker::decode_step`]
#[derive(Debug, PartialEq)]
pub enum DecodeStep {
    /// The codec produced a frame for the current epoch
    Produced(RawFrame),

    /// The end marker of the current epoch reached the codec
    EndOfStream,

    /// The codec is drained for the current epoch
    EndOfEpoch,

    /// The packet queue was aborted
    Aborted,
}

/// Progress shared between a worker and the coordinator
#[derive(Debug, Default)]
pub struct WorkerStatus {
    /// Serial of the epoch the codec has fully drained, zero when none
    finished: AtomicU64,

    /// Frames delivered to the frame queue
    delivered: AtomicU64,
}

impl WorkerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Epoch whose output has been completely decoded
    pub fn finished_serial(&self) -> Option<u64> {
        match self.finished.load(Ordering::Acquire) {
            0 => None,
            serial => Some(serial),
        }
    }

    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn mark_finished(&self, serial: u64) {
        self.finished.store(serial, Ordering::Release);
    }

    fn clear_finished(&self) {
        self.finished.store(0, Ordering::Release);
    }
}

/// Decode loop for one elementary stream
pub struct DecodeWorker<T: MediaTiming> {
    packets: Arc<PacketQueue>,
    frames: Arc<FrameQueue>,
    codec: Box<dyn Codec>,
    timing: T,

    /// Epoch the codec is currently decoding
    pkt_serial: u64,

    /// Unit the codec refused while it still had output pending
    pending: Option<CodedUnit>,

    status: Arc<WorkerStatus>,

    /// Invoked whenever the packet queue runs dry
    on_drained: Option<Box<dyn Fn() + Send>>,
}

impl<T: MediaTiming> DecodeWorker<T> {
    pub fn new(
        packets: Arc<PacketQueue>,
        frames: Arc<FrameQueue>,
        codec: Box<dyn Codec>,
        timing: T,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Self {
            packets,
            frames,
            codec,
            timing,
            pkt_serial: 0,
            pending: None,
            status,
            on_drained: None,
        }
    }

    /// Register a callback fired each time the coded queue is found empty
    pub fn on_drained(mut self, callback: impl Fn() + Send + 'static) -> Self {
        self.on_drained = Some(Box::new(callback));
        self
    }

    pub fn kind(&self) -> StreamKind {
        self.timing.kind()
    }

    pub fn status(&self) -> &Arc<WorkerStatus> {
        &self.status
    }

    /// Advance the decode state machine until something reportable happens
    pub fn decode_step(&mut self) -> Result<DecodeStep> {
        loop {
            if self.packets.serial() == self.pkt_serial {
                loop {
                    if self.packets.is_aborted() {
                        return Ok(DecodeStep::Aborted);
                    }

                    match self.codec.receive() {
                        ReceiveStatus::Frame(frame) => return Ok(DecodeStep::Produced(frame)),
                        ReceiveStatus::EndOfEpoch => {
                            debug!("{} decoder drained epoch {}", self.kind(), self.pkt_serial);
                            self.status.mark_finished(self.pkt_serial);
                            self.codec.flush();
                            return Ok(DecodeStep::EndOfEpoch);
                        }
                        ReceiveStatus::NeedMoreInput => break,
                        ReceiveStatus::Fatal(failure) => return Err(self.fatal(failure)),
                    }
                }
            }

            let unit = match self.next_unit() {
                Some(unit) => unit,
                None => return Ok(DecodeStep::Aborted),
            };

            match self.codec.send(&unit) {
                SendStatus::Accepted if unit.is_end() => {
                    debug!("{} end of stream in epoch {}", self.kind(), self.pkt_serial);
                    return Ok(DecodeStep::EndOfStream);
                }
                SendStatus::Accepted => {}
                SendStatus::Rejected => {
                    trace!("{} codec busy, holding unit", self.kind());
                    self.pending = Some(unit);
                }
            }
        }
    }

    /// Next unit of the current epoch, handling flush markers on the way
    fn next_unit(&mut self) -> Option<CodedUnit> {
        loop {
            if self.packets.is_empty() {
                if let Some(callback) = &self.on_drained {
                    callback();
                }
            }

            let unit = match self.pending.take() {
                Some(unit) => unit,
                None => match self.packets.get(true) {
                    Dequeue::Got(unit, _) => unit,
                    Dequeue::Aborted => return None,
                    Dequeue::Empty => continue,
                },
            };

            if unit.serial != self.packets.serial() {
                trace!("{} discarding unit from stale epoch {}", self.kind(), unit.serial);
                continue;
            }

            if unit.is_flush() {
                self.pkt_serial = unit.serial;
                self.codec.flush();
                self.timing.reset();
                self.status.clear_finished();
                debug!("{} decoder reset for epoch {}", self.kind(), self.pkt_serial);
                continue;
            }

            return Some(unit);
        }
    }

    fn fatal(&self, failure: CodecFailure) -> SyncError {
        let stream = self.kind();
        match failure {
            CodecFailure::Allocation(message) => SyncError::Allocation { stream, message },
            CodecFailure::Other(message) => SyncError::CodecFatal { stream, message },
        }
    }

    /// Normalize and push one frame; false once the frame queue is aborted
    fn deliver(&mut self, frame: RawFrame) -> bool {
        let pts = self.timing.normalize_timestamp(&frame);
        if !self.timing.admit(pts, self.pkt_serial, &self.packets) {
            trace!("{} frame at {:?} dropped before queueing", self.kind(), pts);
            return true;
        }
        let duration = self.timing.frame_duration(&frame);

        let Some(slot) = self.frames.peek_writable() else {
            return false;
        };
        let unit = DecodedUnit {
            data: frame.data,
            pts,
            duration,
            pos: frame.pos,
            serial: self.pkt_serial,
            uploaded: false,
            geometry: frame.geometry,
        };
        if let Some(displaced) = slot.push(unit) {
            self.codec.recycle(displaced);
        }
        self.status.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Run until the stream is aborted or the codec fails
    pub fn run(mut self) -> Result<()> {
        let kind = self.kind();
        info!("{} decode worker started", kind);

        loop {
            match self.decode_step() {
                Ok(DecodeStep::Produced(frame)) => {
                    if !self.deliver(frame) {
                        break;
                    }
                }
                Ok(DecodeStep::EndOfStream | DecodeStep::EndOfEpoch) => {}
                Ok(DecodeStep::Aborted) => break,
                Err(e) => {
                    error!("{} decode worker failed: {}", kind, e);
                    return Err(e);
                }
            }
        }

        info!(
            "{} decode worker stopped ({} frames delivered)",
            kind,
            self.status.frames_delivered()
        );
        Ok(())
    }
}
