//! Per-media timestamp handling for decode workers
//!
//! The decode loop itself is media-agnostic; everything that differs
//! between video, audio and subtitles (which timestamp to trust, how to
//! predict a missing one, whether a late frame may be dropped early) sits
//! behind [`MediaTiming`].

use super::packet_queue::PacketQueue;
use super::unit::{Geometry, TimeBase};
use super::{RawFrame, ReorderPolicy, StreamKind};
use std::sync::Arc;

/// Per-media capability used by [`DecodeWorker`](super::DecodeWorker)
pub trait MediaTiming: Send {
    fn kind(&self) -> StreamKind;

    /// Presentation time of a decoded frame in seconds
    fn normalize_timestamp(&mut self, frame: &RawFrame) -> Option<f64>;

    /// Duration estimate of a decoded frame in seconds
    fn frame_duration(&self, frame: &RawFrame) -> f64;

    /// Whether a decoded frame should be delivered at all
    fn admit(&mut self, _pts: Option<f64>, _serial: u64, _packets: &PacketQueue) -> bool {
        true
    }

    /// Forget prediction state after an epoch change
    fn reset(&mut self);
}

/// Master-clock view consulted by the video early-drop check
pub trait EarlyDropGate: Send + Sync {
    /// Policy allows dropping with the current master selection
    fn early_drop_enabled(&self) -> bool;

    fn master_time(&self) -> Option<f64>;

    /// Serial of the video clock's last update
    fn video_clock_serial(&self) -> Option<u64>;

    fn nosync_threshold(&self) -> f64;

    fn record_early_drop(&self);
}

/// Video timestamp selection and early drop
pub struct VideoTiming {
    time_base: TimeBase,
    reorder: ReorderPolicy,
    frame_rate: Option<f64>,
    gate: Option<Arc<dyn EarlyDropGate>>,
}

impl VideoTiming {
    pub fn new(time_base: TimeBase, reorder: ReorderPolicy, frame_rate: Option<f64>) -> Self {
        Self {
            time_base,
            reorder,
            frame_rate,
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn EarlyDropGate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl MediaTiming for VideoTiming {
    fn kind(&self) -> StreamKind {
        StreamKind::Video
    }

    fn normalize_timestamp(&mut self, frame: &RawFrame) -> Option<f64> {
        let ticks = match self.reorder {
            ReorderPolicy::Auto => frame.best_effort_pts,
            ReorderPolicy::On => frame.pts,
            ReorderPolicy::Off => frame.pkt_dts,
        };
        ticks.map(|ticks| self.time_base.to_seconds(ticks))
    }

    fn frame_duration(&self, frame: &RawFrame) -> f64 {
        match self.frame_rate {
            Some(fps) if fps > 0.0 => 1.0 / fps,
            _ => frame
                .duration
                .map_or(0.0, |ticks| self.time_base.to_seconds(ticks)),
        }
    }

    fn admit(&mut self, pts: Option<f64>, serial: u64, packets: &PacketQueue) -> bool {
        let (Some(gate), Some(pts)) = (&self.gate, pts) else {
            return true;
        };
        if !gate.early_drop_enabled() {
            return true;
        }
        let Some(master) = gate.master_time() else {
            return true;
        };

        let diff = pts - master;
        let lagging = diff.abs() < gate.nosync_threshold() && diff < 0.0;
        let current_epoch = gate.video_clock_serial() == Some(serial);
        if lagging && current_epoch && !packets.is_empty() {
            gate.record_early_drop();
            return false;
        }
        true
    }

    fn reset(&mut self) {}
}

/// Audio timestamp conversion and prediction
pub struct AudioTiming {
    time_base: TimeBase,
    start_pts: Option<i64>,

    /// Predicted pts of the next frame and the time base it is expressed in
    next_pts: Option<(i64, TimeBase)>,
}

impl AudioTiming {
    pub fn new(time_base: TimeBase, start_pts: Option<i64>) -> Self {
        Self {
            time_base,
            start_pts,
            next_pts: start_pts.map(|pts| (pts, time_base)),
        }
    }

    fn layout(frame: &RawFrame) -> Option<(u32, usize)> {
        match frame.geometry {
            Geometry::Audio { sample_rate, samples, .. } if sample_rate > 0 => Some((sample_rate, samples)),
            _ => None,
        }
    }
}

impl MediaTiming for AudioTiming {
    fn kind(&self) -> StreamKind {
        StreamKind::Audio
    }

    fn normalize_timestamp(&mut self, frame: &RawFrame) -> Option<f64> {
        let Some((sample_rate, samples)) = Self::layout(frame) else {
            return frame.pts.map(|pts| self.time_base.to_seconds(pts));
        };
        let sample_tb = TimeBase::new(1, sample_rate as i32);

        let pts = match (frame.pts, self.next_pts) {
            (Some(pts), _) => Some(self.time_base.rescale(pts, sample_tb)),
            (None, Some((next, next_tb))) => Some(next_tb.rescale(next, sample_tb)),
            (None, None) => None,
        };

        if let Some(pts) = pts {
            self.next_pts = Some((pts + samples as i64, sample_tb));
        }
        pts.map(|pts| pts as f64 / sample_rate as f64)
    }

    fn frame_duration(&self, frame: &RawFrame) -> f64 {
        Self::layout(frame).map_or(0.0, |(rate, samples)| samples as f64 / rate as f64)
    }

    fn reset(&mut self) {
        self.next_pts = self.start_pts.map(|pts| (pts, self.time_base));
    }
}

/// Subtitle timestamps are taken as-is
pub struct SubtitleTiming {
    time_base: TimeBase,
}

impl SubtitleTiming {
    pub fn new(time_base: TimeBase) -> Self {
        Self { time_base }
    }
}

impl MediaTiming for SubtitleTiming {
    fn kind(&self) -> StreamKind {
        StreamKind::Subtitle
    }

    fn normalize_timestamp(&mut self, frame: &RawFrame) -> Option<f64> {
        frame.pts.map(|pts| self.time_base.to_seconds(pts))
    }

    fn frame_duration(&self, frame: &RawFrame) -> f64 {
        match frame.geometry {
            Geometry::Subtitle { start, end } if end > start => end - start,
            _ => frame
                .duration
                .map_or(0.0, |ticks| self.time_base.to_seconds(ticks)),
        }
    }

    fn reset(&mut self) {}
}
