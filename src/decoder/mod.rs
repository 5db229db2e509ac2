//! Decoder module for avsync
//!
//! Everything between the reader and the presentation side of one
//! elementary stream: the coded-unit queue, the decoded-unit ring, and the
//! decode worker that drives an external codec between them. Actual
//! decompression is delegated to a [`Codec`] implementation.

mod frame_queue;
mod packet_queue;
mod timing;
mod unit;
mod worker;

pub use frame_queue::{FrameInfo, FrameQueue, WriteSlot};
pub use packet_queue::{Dequeue, PacketQueue, QueueStats};
pub use timing::{AudioTiming, EarlyDropGate, MediaTiming, SubtitleTiming, VideoTiming};
pub use unit::{
    CodedUnit, DecodedUnit, FrameData, Geometry, TimeBase, UnitPayload, UNIT_OVERHEAD_BYTES,
};
pub use worker::{DecodeStep, DecodeWorker, WorkerStatus};

use crate::utils::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Elementary stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Video, StreamKind::Audio, StreamKind::Subtitle];

    /// Dense index for per-kind tables
    pub fn index(self) -> usize {
        match self {
            StreamKind::Video => 0,
            StreamKind::Audio => 1,
            StreamKind::Subtitle => 2,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Subtitle => "subtitle",
        };
        f.write_str(name)
    }
}

/// Which timestamp a video frame is presented at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReorderPolicy {
    /// Trust the codec's best-effort reordered estimate
    Auto,
    /// Use the frame's own presentation timestamp
    On,
    /// Use the decode timestamp of the originating unit
    Off,
}

/// When video frames may be dropped to keep up with the master clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDropPolicy {
    /// Only when video is not the master clock
    Auto,
    /// Always
    On,
    /// Never
    Off,
}

impl FrameDropPolicy {
    /// Whether dropping is allowed given the current master
    pub fn allows_drop(self, video_is_master: bool) -> bool {
        match self {
            FrameDropPolicy::Auto => !video_is_master,
            FrameDropPolicy::On => true,
            FrameDropPolicy::Off => false,
        }
    }
}

fn parse_tristate(s: &str) -> Option<u8> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" | "-1" => Some(0),
        "on" | "1" | "true" => Some(1),
        "off" | "0" | "false" => Some(2),
        _ => None,
    }
}

impl FromStr for ReorderPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_tristate(s) {
            Some(0) => Ok(ReorderPolicy::Auto),
            Some(1) => Ok(ReorderPolicy::On),
            Some(2) => Ok(ReorderPolicy::Off),
            _ => Err(SyncError::Config(format!("Invalid reorder policy '{}'", s))),
        }
    }
}

impl FromStr for FrameDropPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_tristate(s) {
            Some(0) => Ok(FrameDropPolicy::Auto),
            Some(1) => Ok(FrameDropPolicy::On),
            Some(2) => Ok(FrameDropPolicy::Off),
            _ => Err(SyncError::Config(format!("Invalid frame drop policy '{}'", s))),
        }
    }
}

/// Parameters of an elementary stream, supplied by the reader at open time
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub kind: StreamKind,

    /// Time unit of the stream's coded timestamps
    pub time_base: TimeBase,

    /// First timestamp of the stream in `time_base` ticks
    pub start_time: Option<i64>,

    /// Nominal frame rate (video)
    pub frame_rate: Option<f64>,

    /// Sample rate and channel count (audio)
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,

    /// The container may jump timestamps (e.g. MPEG-TS)
    pub timestamps_discontinuous: bool,

    /// The source is live and cannot be paced by the reader
    pub realtime: bool,
}

impl StreamParams {
    pub fn video(time_base: TimeBase, frame_rate: f64) -> Self {
        Self {
            kind: StreamKind::Video,
            time_base,
            start_time: None,
            frame_rate: Some(frame_rate),
            sample_rate: None,
            channels: None,
            timestamps_discontinuous: false,
            realtime: false,
        }
    }

    pub fn audio(time_base: TimeBase, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: StreamKind::Audio,
            time_base,
            start_time: None,
            frame_rate: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            timestamps_discontinuous: false,
            realtime: false,
        }
    }

    pub fn subtitle(time_base: TimeBase) -> Self {
        Self {
            kind: StreamKind::Subtitle,
            time_base,
            start_time: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            timestamps_discontinuous: false,
            realtime: false,
        }
    }

    pub fn with_start_time(mut self, ticks: i64) -> Self {
        self.start_time = Some(ticks);
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_discontinuous_timestamps(mut self, discontinuous: bool) -> Self {
        self.timestamps_discontinuous = discontinuous;
        self
    }

    /// Upper bound for a plausible frame duration in seconds
    pub fn max_frame_duration(&self) -> f64 {
        if self.timestamps_discontinuous {
            10.0
        } else {
            3600.0
        }
    }
}

/// A decoded frame as returned by the codec, timestamps still in stream ticks
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub data: FrameData,

    /// Timestamp the codec attached to the frame
    pub pts: Option<i64>,

    /// Codec's reordered presentation estimate
    pub best_effort_pts: Option<i64>,

    /// Decode timestamp of the coded unit that produced the frame
    pub pkt_dts: Option<i64>,

    pub duration: Option<i64>,
    pub pos: Option<i64>,
    pub geometry: Geometry,
}

/// Result of offering a unit to the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// The codec must be drained before it can take this unit; retry it later
    Rejected,
}

/// Unrecoverable codec failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecFailure {
    Allocation(String),
    Other(String),
}

/// Result of asking the codec for output
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveStatus {
    Frame(RawFrame),
    NeedMoreInput,
    /// All output for the current epoch has been returned
    EndOfEpoch,
    Fatal(CodecFailure),
}

/// External codec collaborator
///
/// Implementations perform the actual decompression. An end-of-stream unit
/// is sent like any other unit and asks the codec to drain; once drained,
/// `receive` reports [`ReceiveStatus::EndOfEpoch`].
pub trait Codec: Send {
    /// Offer a coded unit
    fn send(&mut self, unit: &CodedUnit) -> SendStatus;

    /// Pull the next decoded frame
    fn receive(&mut self) -> ReceiveStatus;

    /// Drop all internal decode state (called on epoch change)
    fn flush(&mut self);

    /// Hand back a buffer displaced from the frame ring for reuse
    fn recycle(&mut self, _data: FrameData) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_display() {
        assert_eq!(StreamKind::Video.to_string(), "video");
        assert_eq!(StreamKind::Subtitle.index(), 2);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("auto".parse::<ReorderPolicy>().unwrap(), ReorderPolicy::Auto);
        assert_eq!("0".parse::<ReorderPolicy>().unwrap(), ReorderPolicy::Off);
        assert_eq!("ON".parse::<FrameDropPolicy>().unwrap(), FrameDropPolicy::On);
        assert!("sometimes".parse::<FrameDropPolicy>().is_err());
    }

    #[test]
    fn test_frame_drop_policy() {
        assert!(FrameDropPolicy::Auto.allows_drop(false));
        assert!(!FrameDropPolicy::Auto.allows_drop(true));
        assert!(FrameDropPolicy::On.allows_drop(true));
        assert!(!FrameDropPolicy::Off.allows_drop(false));
    }

    #[test]
    fn test_max_frame_duration() {
        let params = StreamParams::video(TimeBase::new(1, 90_000), 25.0);
        assert_eq!(params.max_frame_duration(), 3600.0);
        assert_eq!(params.with_discontinuous_timestamps(true).max_frame_duration(), 10.0);
    }
}
