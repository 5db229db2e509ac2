//! Audio output module for avsync
//!
//! The platform audio subsystem pulls samples from its own callback thread.
//! [`AudioPump`] runs inside that callback: it picks the next current-epoch
//! audio unit, asks the coordinator how many samples to play for it, hands
//! it to the [`AudioOutput`] collaborator and re-anchors the audio clock
//! with the output latency taken into account.

pub mod sync;

pub use sync::AudioDriftCorrector;

use crate::decoder::{DecodedUnit, Geometry, StreamKind};
use crate::sync::{MediaStream, SyncCoordinator};
use crate::utils::error::{Result, SyncError};
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Render collaborator for audio
pub trait AudioOutput: Send {
    /// Play a decoded audio unit
    ///
    /// # Arguments
    ///
    /// * `unit` - Decoded samples; format conversion is up to the output
    /// * `wanted_samples` - Samples per channel to produce from this unit
    ///   (differs from the unit's own count when drift is being corrected)
    /// * `volume` - Volume level (0.0 to 1.0)
    /// * `muted` - Output silence of the same length instead
    fn output_audio(&mut self, unit: &DecodedUnit, wanted_samples: usize, volume: f32, muted: bool);

    /// Fill `samples` samples per channel with silence
    fn output_silence(&mut self, samples: usize);
}

/// Volume and mute shared between the control surface and the audio callback
#[derive(Debug)]
pub struct AudioLevels {
    /// f32 bits
    volume: AtomicU32,
    muted: AtomicBool,
}

impl AudioLevels {
    pub fn new(volume: f32, muted: bool) -> Self {
        Self {
            volume: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            muted: AtomicBool::new(muted),
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Set volume, clamped to 0.0 - 1.0
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` to the volume
    pub fn adjust_volume(&self, delta: f32) {
        self.set_volume(self.volume() + delta);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Flip mute and return the new state
    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::Relaxed)
    }
}

impl Default for AudioLevels {
    fn default() -> Self {
        Self::new(1.0, false)
    }
}

/// Audio-callback side of the audio stream
pub struct AudioPump {
    sync: Arc<SyncCoordinator>,
    stream: Arc<MediaStream>,
    output: Box<dyn AudioOutput>,
    levels: Arc<AudioLevels>,

    /// Samples of the current unit not yet consumed by the device
    buffered: usize,

    /// Presentation time at the end of the current unit
    audio_clock: Option<f64>,
    clock_serial: u64,
    sample_rate: u32,
}

impl AudioPump {
    /// Attach to the coordinator's open audio stream
    pub fn new(
        sync: Arc<SyncCoordinator>,
        output: Box<dyn AudioOutput>,
        levels: Arc<AudioLevels>,
    ) -> Result<Self> {
        let stream = sync
            .stream(StreamKind::Audio)
            .ok_or(SyncError::StreamNotOpen(StreamKind::Audio))?;
        let sample_rate = stream.params.sample_rate.unwrap_or(0);
        Ok(Self {
            sync,
            stream,
            output,
            levels,
            buffered: 0,
            audio_clock: None,
            clock_serial: 0,
            sample_rate,
        })
    }

    /// Serve one device callback asking for `requested` samples per channel
    ///
    /// Never blocks. Returns the number of samples that came from decoded
    /// audio; the rest was silence.
    pub fn fill(&mut self, requested: usize) -> usize {
        let callback_time = self.sync.time_source().now();
        let mut left = requested;
        let mut played = 0;

        while left > 0 {
            if self.buffered == 0 {
                match self.next_unit() {
                    Some(samples) => self.buffered = samples,
                    None => {
                        self.output.output_silence(left);
                        if !self.sync.is_paused() {
                            self.sync.record_underrun();
                        }
                        break;
                    }
                }
            }
            let take = left.min(self.buffered);
            self.buffered -= take;
            left -= take;
            played += take;
        }

        // A paused clock keeps the value it froze at
        if self.sync.is_paused() {
            return played;
        }
        if let Some(clock) = self.audio_clock.filter(|_| self.sample_rate > 0) {
            let hw = self.sync.config().audio.hw_buffer_samples;
            let latency = (2 * hw + self.buffered) as f64 / self.sample_rate as f64;
            self.stream
                .clock
                .set_at(Some(clock - latency), self.clock_serial, callback_time);
            self.sync
                .external_clock()
                .sync_to(&self.stream.clock, self.sync.config().sync.nosync_threshold);
        }
        played
    }

    /// Output the next current-epoch unit; returns the samples it occupies
    fn next_unit(&mut self) -> Option<usize> {
        if self.sync.is_paused() {
            return None;
        }

        let frames = &self.stream.frames;
        let info = loop {
            let info = frames.peek()?;
            frames.next();
            if info.serial == self.stream.packets.serial() {
                break info;
            }
            debug!("audio pump skipped stale unit from epoch {}", info.serial);
        };

        let wanted = self.sync.synchronize_audio(info.samples);
        let volume = self.levels.volume();
        let muted = self.levels.is_muted();
        let output = &mut self.output;
        let rate = frames.with_last(|unit| {
            output.output_audio(unit, wanted, volume, muted);
            match unit.geometry {
                Geometry::Audio { sample_rate, .. } => sample_rate,
                _ => 0,
            }
        });
        if let Some(rate) = rate.filter(|&rate| rate > 0) {
            self.sample_rate = rate;
        }

        self.audio_clock = match (info.pts, self.sample_rate) {
            (Some(pts), rate) if rate > 0 => Some(pts + info.samples as f64 / rate as f64),
            _ => None,
        };
        self.clock_serial = info.serial;
        Some(wanted)
    }

    /// Audio clock value at the end of the last queued unit
    pub fn audio_clock(&self) -> Option<f64> {
        self.audio_clock
    }
}
