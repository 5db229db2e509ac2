//! Integration test utilities for avsync
//!
//! This module provides common utilities for integration testing including:
//! - A synthetic clip generator and codec
//! - A renderer that records what was presented
//! - A harness that drives pacing and the audio callback on a simulated clock

use anyhow::{bail, Result};
use avsync::decoder::{
    Codec, CodedUnit, FrameData, Geometry, RawFrame, ReceiveStatus, SendStatus, StreamKind,
    StreamParams, TimeBase,
};
use avsync::sync::{ManualTimeSource, MediaStream};
use avsync::{AudioOutput, AudioPump, Config, DecodedUnit, PlayerController, VideoRenderer};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shape of the synthetic clip
#[derive(Debug, Clone, Copy)]
pub struct Clip {
    pub duration: f64,
    pub fps: u32,
    pub sample_rate: u32,
    pub samples_per_unit: i64,
}

impl Default for Clip {
    fn default() -> Self {
        Self {
            duration: 2.0,
            fps: 25,
            sample_rate: 48_000,
            samples_per_unit: 1024,
        }
    }
}

impl Clip {
    /// Interleaved coded units from `start` seconds to the end, in container order
    pub fn units_from(&self, start: f64) -> Vec<CodedUnit> {
        let mut video = (start * self.fps as f64).floor() as i64;
        let mut audio = (start * self.sample_rate as f64 / self.samples_per_unit as f64).floor() as i64;
        let mut units = Vec::new();

        loop {
            let video_time = video as f64 / self.fps as f64;
            let audio_time = (audio * self.samples_per_unit) as f64 / self.sample_rate as f64;
            let video_left = video_time < self.duration;
            let audio_left = audio_time < self.duration;

            if video_left && (!audio_left || video_time <= audio_time) {
                units.push(
                    CodedUnit::media(StreamKind::Video, vec![0; 1000])
                        .with_pts(video)
                        .with_dts(video)
                        .with_duration(1)
                        .with_pos(units.len() as i64 * 1000),
                );
                video += 1;
            } else if audio_left {
                units.push(
                    CodedUnit::media(StreamKind::Audio, vec![0; 100])
                        .with_pts(audio * self.samples_per_unit)
                        .with_duration(self.samples_per_unit)
                        .with_pos(units.len() as i64 * 1000),
                );
                audio += 1;
            } else {
                return units;
            }
        }
    }

    /// Seconds of audio per device callback
    pub fn period(&self) -> f64 {
        self.samples_per_unit as f64 / self.sample_rate as f64
    }
}

/// Codec producing one blank picture or audio block per unit
pub struct SyntheticCodec {
    kind: StreamKind,
    sample_rate: u32,
    output: VecDeque<RawFrame>,
    draining: bool,
}

impl SyntheticCodec {
    pub fn new(kind: StreamKind, sample_rate: u32) -> Self {
        Self {
            kind,
            sample_rate,
            output: VecDeque::new(),
            draining: false,
        }
    }
}

impl Codec for SyntheticCodec {
    fn send(&mut self, unit: &CodedUnit) -> SendStatus {
        if unit.is_end() {
            self.draining = true;
            return SendStatus::Accepted;
        }

        let (data, geometry) = match self.kind {
            StreamKind::Audio => {
                let samples = unit.duration.unwrap_or(0) as usize;
                (
                    FrameData::Samples(vec![0.0; samples * 2]),
                    Geometry::Audio {
                        sample_rate: self.sample_rate,
                        channels: 2,
                        samples,
                    },
                )
            }
            _ => (
                FrameData::Packed {
                    data: vec![0; 16],
                    stride: 8,
                },
                Geometry::Picture {
                    width: 2,
                    height: 2,
                    sar: 1.0,
                },
            ),
        };
        self.output.push_back(RawFrame {
            data,
            pts: unit.pts,
            best_effort_pts: unit.pts,
            pkt_dts: unit.dts,
            duration: unit.duration,
            pos: unit.pos,
            geometry,
        });
        SendStatus::Accepted
    }

    fn receive(&mut self) -> ReceiveStatus {
        match self.output.pop_front() {
            Some(frame) => ReceiveStatus::Frame(frame),
            None if self.draining => {
                self.draining = false;
                ReceiveStatus::EndOfEpoch
            }
            None => ReceiveStatus::NeedMoreInput,
        }
    }

    fn flush(&mut self) {
        self.output.clear();
        self.draining = false;
    }
}

/// One presented video unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shown {
    pub pts: Option<f64>,
    pub serial: u64,
}

/// Renderer that records every presentation
pub struct RecordingRenderer {
    shown: Arc<Mutex<Vec<Shown>>>,
}

impl RecordingRenderer {
    pub fn new() -> (Self, Arc<Mutex<Vec<Shown>>>) {
        let shown = Arc::new(Mutex::new(Vec::new()));
        (Self { shown: shown.clone() }, shown)
    }
}

impl VideoRenderer for RecordingRenderer {
    fn upload_and_display(&mut self, unit: &DecodedUnit) -> avsync::Result<()> {
        self.shown.lock().push(Shown {
            pts: unit.pts,
            serial: unit.serial,
        });
        Ok(())
    }
}

/// Audio device stand-in
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn output_audio(&mut self, _unit: &DecodedUnit, _wanted: usize, _volume: f32, _muted: bool) {}

    fn output_silence(&mut self, _samples: usize) {}
}

/// A two-stream player driven tick by tick on a simulated clock
///
/// Each tick lets the decode workers settle, serves one audio callback,
/// runs one pacing tick and then advances the clock by one callback period.
pub struct Harness {
    pub clip: Clip,
    pub time: Arc<ManualTimeSource>,
    pub player: PlayerController,
    pub shown: Arc<Mutex<Vec<Shown>>>,
    renderer: RecordingRenderer,
    pump: AudioPump,
}

impl Harness {
    pub fn new(clip: Clip) -> Result<Self> {
        let time = Arc::new(ManualTimeSource::new(0.0));
        let player = PlayerController::with_time_source(Config::default(), time.clone())?;

        player.open_stream(
            StreamParams::video(TimeBase::new(1, clip.fps as i32), clip.fps as f64),
            Box::new(SyntheticCodec::new(StreamKind::Video, clip.sample_rate)),
        )?;
        player.open_stream(
            StreamParams::audio(TimeBase::new(1, clip.sample_rate as i32), clip.sample_rate, 2),
            Box::new(SyntheticCodec::new(StreamKind::Audio, clip.sample_rate)),
        )?;
        let pump = player.audio_pump(Box::new(NullOutput))?;
        let (renderer, shown) = RecordingRenderer::new();

        Ok(Self {
            clip,
            time,
            player,
            shown,
            renderer,
            pump,
        })
    }

    /// Feed the clip from `start` seconds, then end markers
    pub fn feed_from(&self, start: f64) -> Result<()> {
        for unit in self.clip.units_from(start) {
            self.player.feed(unit)?;
        }
        self.player.feed_end_markers();
        Ok(())
    }

    pub fn stream(&self, kind: StreamKind) -> Result<Arc<MediaStream>> {
        match self.player.coordinator().stream(kind) {
            Some(stream) => Ok(stream),
            None => bail!("{} stream not open", kind),
        }
    }

    /// Wait until every worker is blocked on a full ring or done with its epoch
    pub fn settle(&self) -> Result<()> {
        for kind in [StreamKind::Video, StreamKind::Audio] {
            let stream = self.stream(kind)?;
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let frames = &stream.frames;
                let full = frames.remaining() + frames.has_shown() as usize >= frames.capacity();
                let finished = stream.status.finished_serial() == Some(stream.packets.serial());
                if full || finished {
                    break;
                }
                if Instant::now() > deadline {
                    bail!("{} worker did not settle", kind);
                }
                thread::sleep(Duration::from_micros(200));
            }
        }
        Ok(())
    }

    pub fn tick(&mut self) -> Result<()> {
        self.settle()?;
        self.pump.fill(self.clip.samples_per_unit as usize);
        self.player.coordinator().video_refresh(&mut self.renderer);
        self.time.advance(self.clip.period());
        Ok(())
    }
}
