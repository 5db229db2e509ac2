//! Coded and decoded unit types
//!
//! A [`CodedUnit`] is what the reader hands to a stream's packet queue; the
//! flush and end-of-stream control units travel in-band as payload variants.
//! A [`DecodedUnit`] is what a decode worker places into a frame queue slot.

use super::StreamKind;
use serde::{Deserialize, Serialize};

/// Fixed per-unit bookkeeping charge added to queued byte totals
pub const UNIT_OVERHEAD_BYTES: usize = 64;

/// Rational time unit of a stream's timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    /// Microsecond ticks
    pub const MICROS: TimeBase = TimeBase { num: 1, den: 1_000_000 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Length of one tick in seconds
    pub fn seconds_per_tick(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Convert a tick count to seconds
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.seconds_per_tick()
    }

    /// Convert seconds to the nearest tick count
    pub fn from_seconds(&self, seconds: f64) -> i64 {
        let per_tick = self.seconds_per_tick();
        if per_tick == 0.0 {
            0
        } else {
            (seconds / per_tick).round() as i64
        }
    }

    /// Rescale a tick count from this time base into `other`
    pub fn rescale(&self, ticks: i64, other: TimeBase) -> i64 {
        let num = ticks as i128 * self.num as i128 * other.den as i128;
        let den = self.den as i128 * other.num as i128;
        if den == 0 {
            return 0;
        }
        // round half away from zero
        let half = den.abs() / 2;
        let value = if (num >= 0) == (den > 0) {
            (num.abs() + half) / den.abs()
        } else {
            -((num.abs() + half) / den.abs())
        };
        value as i64
    }
}

/// Payload of a coded unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitPayload {
    /// Compressed media bytes
    Media(Vec<u8>),

    /// Invalidates everything queued before it by bumping the queue serial
    Flush,

    /// Drains the codec; does not change the serial
    EndOfStream,
}

/// A compressed unit with its timing metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CodedUnit {
    pub payload: UnitPayload,

    /// Presentation timestamp in stream ticks
    pub pts: Option<i64>,

    /// Decode timestamp in stream ticks
    pub dts: Option<i64>,

    /// Duration in stream ticks
    pub duration: Option<i64>,

    /// Which elementary stream this unit belongs to
    pub stream: StreamKind,

    /// Byte position in the source, when known
    pub pos: Option<i64>,

    /// Epoch serial, assigned by the queue on enqueue
    pub serial: u64,
}

impl CodedUnit {
    /// A media unit with no timing set yet
    pub fn media(stream: StreamKind, data: Vec<u8>) -> Self {
        Self {
            payload: UnitPayload::Media(data),
            pts: None,
            dts: None,
            duration: None,
            stream,
            pos: None,
            serial: 0,
        }
    }

    pub fn flush_marker(stream: StreamKind) -> Self {
        Self {
            payload: UnitPayload::Flush,
            ..Self::media(stream, Vec::new())
        }
    }

    pub fn end_marker(stream: StreamKind) -> Self {
        Self {
            payload: UnitPayload::EndOfStream,
            ..Self::media(stream, Vec::new())
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_pos(mut self, pos: i64) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn is_flush(&self) -> bool {
        matches!(self.payload, UnitPayload::Flush)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.payload, UnitPayload::EndOfStream)
    }

    /// Payload size in bytes (zero for control units)
    pub fn payload_len(&self) -> usize {
        match &self.payload {
            UnitPayload::Media(data) => data.len(),
            UnitPayload::Flush | UnitPayload::EndOfStream => 0,
        }
    }
}

/// Decoded sample or pixel data
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    /// Planar picture data (e.g. YUV 4:2:0)
    Planar {
        planes: Vec<Vec<u8>>,
        strides: Vec<usize>,
    },

    /// Packed picture data (e.g. RGBA)
    Packed {
        data: Vec<u8>,
        stride: usize,
    },

    /// Interleaved audio samples
    Samples(Vec<f32>),

    /// Subtitle text
    Text(String),

    /// No payload (synthetic or already released)
    Empty,
}

impl FrameData {
    /// Size of the buffer in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            FrameData::Planar { planes, .. } => planes.iter().map(Vec::len).sum(),
            FrameData::Packed { data, .. } => data.len(),
            FrameData::Samples(samples) => samples.len() * std::mem::size_of::<f32>(),
            FrameData::Text(text) => text.len(),
            FrameData::Empty => 0,
        }
    }
}

/// Media geometry of a decoded unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Geometry {
    Picture {
        width: u32,
        height: u32,
        /// Sample aspect ratio
        sar: f32,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        /// Samples per channel
        samples: usize,
    },
    Subtitle {
        /// Display window relative to the unit's pts, in seconds
        start: f64,
        end: f64,
    },
}

/// A decoded frame as stored in a frame queue slot
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedUnit {
    pub data: FrameData,

    /// Presentation timestamp in seconds
    pub pts: Option<f64>,

    /// Estimated duration in seconds
    pub duration: f64,

    /// Byte position of the originating coded unit
    pub pos: Option<i64>,

    /// Epoch serial of the originating coded unit
    pub serial: u64,

    /// Set once the render collaborator has uploaded this unit
    pub uploaded: bool,

    pub geometry: Geometry,
}

impl DecodedUnit {
    /// Samples per channel for audio units, zero otherwise
    pub fn sample_count(&self) -> usize {
        match self.geometry {
            Geometry::Audio { samples, .. } => samples,
            _ => 0,
        }
    }
}
