//! Synchronization coordinator
//!
//! Owns the per-stream queues and clocks plus the external clock, and
//! implements everything that needs a view across streams: master clock
//! selection, audio sample correction, external clock speed adaptation,
//! buffering decisions, seek/flush orchestration, pause and single-step.
//! The video pacing tick lives in `pacing.rs`.

use super::clock::{Clock, SerialSource, TimeSource};
use super::SyncMode;
use crate::audio::sync::AudioDriftCorrector;
use crate::decoder::{
    CodedUnit, EarlyDropGate, FrameQueue, PacketQueue, QueueStats, StreamKind, StreamParams,
    VideoTiming, WorkerStatus,
};
use crate::utils::config::Config;
use crate::utils::error::{Result, SyncError};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Queues, clock and worker status of one open elementary stream
pub struct MediaStream {
    pub params: StreamParams,
    pub packets: Arc<PacketQueue>,
    pub frames: Arc<FrameQueue>,
    pub clock: Arc<Clock>,
    pub status: Arc<WorkerStatus>,
}

impl MediaStream {
    pub fn kind(&self) -> StreamKind {
        self.params.kind
    }

    /// Worker drained the current epoch and every decoded unit was consumed
    pub fn is_drained(&self) -> bool {
        self.status.finished_serial() == Some(self.packets.serial()) && self.frames.remaining() == 0
    }

    /// Enough coded data is queued that the reader may pause
    fn has_enough_packets(&self, min_frames: usize, min_duration: f64) -> bool {
        if self.packets.is_aborted() {
            return true;
        }
        let stats = self.packets.stats();
        stats.packets > min_frames && stats.duration_secs().map_or(true, |secs| secs > min_duration)
    }
}

/// Answer to "should the reader keep reading"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Queued bytes exceed the hard cap
    Full,

    /// Every open stream has enough queued data
    StreamsSatisfied,

    /// Keep reading
    NotFull,
}

/// Seek recorded by the control surface, waiting for the reader
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    /// Seconds, or bytes in byte mode
    pub target: f64,

    /// Relative increment that produced the target (same unit)
    pub relative: f64,

    pub byte_mode: bool,
}

/// Snapshot of playback statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub frames_displayed: u64,
    pub late_drops: u64,
    pub early_drops: u64,
    pub audio_underruns: u64,
    pub audio_corrections: u64,

    /// Current master clock value
    pub master_clock: Option<f64>,

    /// Audio clock minus video clock
    pub av_diff: Option<f64>,

    pub external_speed: f64,
    pub paused: bool,
}

/// Per-stream line of a buffer report
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBufferInfo {
    pub kind: StreamKind,
    pub queue: QueueStats,

    /// Decoded units not yet presented
    pub decoded: usize,

    pub finished: bool,
}

/// Result of [`SyncCoordinator::buffer_report`]
#[derive(Debug, Clone, PartialEq)]
pub struct BufferReport {
    pub status: BufferStatus,
    pub total_bytes: usize,
    pub streams: Vec<StreamBufferInfo>,
}

/// Mutable pacing state, guarded as a unit
#[derive(Debug)]
pub(super) struct PacingState {
    /// Ideal presentation instant of the shown frame, wall seconds
    pub(super) frame_timer: f64,

    /// Single-step mode: re-pause after the next presented frame
    pub(super) step: bool,

    /// A new frame was committed and must be drawn
    pub(super) force_refresh: bool,
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) displayed: AtomicU64,
    pub(super) late_drops: AtomicU64,
    pub(super) early_drops: AtomicU64,
    pub(super) underruns: AtomicU64,
    pub(super) corrections: AtomicU64,
}

/// Cross-stream synchronization state
pub struct SyncCoordinator {
    pub(super) config: Config,
    pub(super) time: Arc<dyn TimeSource>,

    /// Preferred master; see [`get_master_sync_type`](Self::get_master_sync_type)
    mode: RwLock<SyncMode>,

    pub(super) external: Arc<Clock>,
    streams: RwLock<[Option<Arc<MediaStream>>; 3]>,

    paused: AtomicBool,
    speed: Mutex<f64>,
    pub(super) pacing: Mutex<PacingState>,
    drift: Mutex<AudioDriftCorrector>,

    seek: Mutex<Option<SeekRequest>>,
    last_seek_target: Mutex<f64>,

    reader_wakeup: Mutex<bool>,
    reader_cond: Condvar,

    pub(super) counters: Counters,
}

impl SyncCoordinator {
    pub fn new(config: Config, time: Arc<dyn TimeSource>) -> Self {
        let external = Arc::new(Clock::new("external", Arc::clone(&time), None));
        let drift = AudioDriftCorrector::new(&config.sync, config.audio.hw_buffer_samples);
        let frame_timer = time.now();
        Self {
            mode: RwLock::new(config.sync.mode),
            config,
            time,
            external,
            streams: RwLock::new([None, None, None]),
            paused: AtomicBool::new(false),
            speed: Mutex::new(1.0),
            pacing: Mutex::new(PacingState {
                frame_timer,
                step: false,
                force_refresh: false,
            }),
            drift: Mutex::new(drift),
            seek: Mutex::new(None),
            last_seek_target: Mutex::new(0.0),
            reader_wakeup: Mutex::new(false),
            reader_cond: Condvar::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    pub fn external_clock(&self) -> &Arc<Clock> {
        &self.external
    }

    /// Create queues and clock for a stream and open its first epoch
    pub fn open_stream(&self, params: StreamParams) -> Result<Arc<MediaStream>> {
        let kind = params.kind;
        let mut streams = self.streams.write();
        if streams[kind.index()].is_some() {
            return Err(SyncError::StreamAlreadyOpen(kind));
        }

        let packets = Arc::new(PacketQueue::new(kind, params.time_base));
        let keep_last = kind != StreamKind::Subtitle;
        let frames = Arc::new(FrameQueue::new(
            kind,
            self.config.decoder.queue_size(kind),
            keep_last,
            Arc::clone(&packets),
        ));
        let name = match kind {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Subtitle => "subtitle",
        };
        let clock = Arc::new(Clock::new(
            name,
            Arc::clone(&self.time),
            Some(Arc::clone(&packets) as Arc<dyn SerialSource>),
        ));
        clock.set_speed(*self.speed.lock());
        if self.is_paused() {
            clock.set_paused(true);
        }
        packets.start();

        let stream = Arc::new(MediaStream {
            params,
            packets,
            frames,
            clock,
            status: Arc::new(WorkerStatus::new()),
        });
        streams[kind.index()] = Some(Arc::clone(&stream));
        drop(streams);

        if kind == StreamKind::Audio {
            self.drift.lock().reset();
        }
        info!("Opened {} stream", kind);
        Ok(stream)
    }

    /// Abort a stream's queues and forget it; siblings keep running
    pub fn close_stream(&self, kind: StreamKind) -> Result<Arc<MediaStream>> {
        let stream = self.streams.write()[kind.index()]
            .take()
            .ok_or(SyncError::StreamNotOpen(kind))?;

        stream.packets.abort();
        stream.frames.signal();
        stream.packets.flush();
        self.wake_reader();
        info!("Closed {} stream", kind);
        Ok(stream)
    }

    pub fn stream(&self, kind: StreamKind) -> Option<Arc<MediaStream>> {
        self.streams.read()[kind.index()].clone()
    }

    pub fn is_open(&self, kind: StreamKind) -> bool {
        self.streams.read()[kind.index()].is_some()
    }

    fn open_streams(&self) -> Vec<Arc<MediaStream>> {
        self.streams.read().iter().flatten().cloned().collect()
    }

    /// Timing capability for a video worker, wired to this coordinator's
    /// early-drop decision
    pub fn video_timing(self: &Arc<Self>, params: &StreamParams) -> VideoTiming {
        let gate: Arc<dyn EarlyDropGate> = Arc::clone(self) as Arc<dyn EarlyDropGate>;
        VideoTiming::new(params.time_base, self.config.decoder.reorder_pts, params.frame_rate)
            .with_gate(gate)
    }

    /// Any open stream comes from a live source
    pub fn is_realtime(&self) -> bool {
        self.open_streams().iter().any(|s| s.params.realtime)
    }

    // Master clock selection

    pub fn set_master_sync(&self, mode: SyncMode) {
        let mut current = self.mode.write();
        if *current != mode {
            info!("Preferred master clock: {} -> {}", *current, mode);
            *current = mode;
        }
    }

    pub fn preferred_sync_type(&self) -> SyncMode {
        *self.mode.read()
    }

    /// Preferred master, downgraded when its stream is not open
    pub fn get_master_sync_type(&self) -> SyncMode {
        let video = self.is_open(StreamKind::Video);
        let audio = self.is_open(StreamKind::Audio);
        match *self.mode.read() {
            SyncMode::VideoMaster if video => SyncMode::VideoMaster,
            SyncMode::VideoMaster | SyncMode::AudioMaster if audio => SyncMode::AudioMaster,
            _ => SyncMode::ExternalMaster,
        }
    }

    fn clock_for(&self, mode: SyncMode) -> Option<Arc<Clock>> {
        match mode {
            SyncMode::VideoMaster => self.stream(StreamKind::Video).map(|s| Arc::clone(&s.clock)),
            SyncMode::AudioMaster => self.stream(StreamKind::Audio).map(|s| Arc::clone(&s.clock)),
            SyncMode::ExternalMaster => Some(Arc::clone(&self.external)),
        }
    }

    /// Current value of the resolved master clock
    pub fn get_master_clock(&self) -> Option<f64> {
        self.clock_for(self.get_master_sync_type())?.now()
    }

    /// Current value of a stream's clock
    pub fn clock_time(&self, kind: StreamKind) -> Option<f64> {
        self.stream(kind)?.clock.now()
    }

    // Audio

    /// Number of samples to output for an audio frame of `nb_samples`
    pub fn synchronize_audio(&self, nb_samples: usize) -> usize {
        if self.get_master_sync_type() == SyncMode::AudioMaster {
            return nb_samples;
        }
        let Some(audio) = self.stream(StreamKind::Audio) else {
            return nb_samples;
        };
        let sample_rate = audio.params.sample_rate.unwrap_or(0);
        let diff = match (audio.clock.now(), self.get_master_clock()) {
            (Some(audio), Some(master)) => Some(audio - master),
            _ => None,
        };

        let wanted = self.drift.lock().wanted_samples(diff, nb_samples, sample_rate);
        if wanted != nb_samples {
            self.counters.corrections.fetch_add(1, Ordering::Relaxed);
        }
        wanted
    }

    pub fn record_underrun(&self) {
        let total = self.counters.underruns.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 || total % 100 == 0 {
            warn!("Audio underrun ({} so far)", total);
        }
    }

    // External clock

    /// Nudge the external clock speed according to queue fill levels
    pub fn check_external_clock_speed(&self) {
        let sync = &self.config.sync;
        let base = self.playback_speed();
        let counts: Vec<usize> = [StreamKind::Video, StreamKind::Audio]
            .iter()
            .filter_map(|kind| self.stream(*kind))
            .map(|stream| stream.packets.len())
            .collect();

        let ratio = self.external.speed() / base;
        let ratio = if counts.iter().any(|&n| n <= sync.external_min_frames) {
            (ratio - sync.external_speed_step).max(sync.external_speed_min)
        } else if counts.iter().all(|&n| n > sync.external_max_frames) {
            (ratio + sync.external_speed_step).min(sync.external_speed_max)
        } else {
            let distance = 1.0 - ratio;
            ratio + distance.signum() * distance.abs().min(sync.external_speed_step)
        };

        let speed = base * ratio;
        if (speed - self.external.speed()).abs() > f64::EPSILON {
            debug!("External clock speed {:.3}", speed);
            self.external.set_speed(speed);
        }
    }

    // Reader side

    /// Whether the reader should stop pulling coded units for now
    pub fn is_buffer_full(&self) -> BufferStatus {
        let buffering = &self.config.buffering;
        if buffering.infinite_buffer.unwrap_or_else(|| self.is_realtime()) {
            return BufferStatus::NotFull;
        }

        let streams = self.open_streams();
        let total: usize = streams.iter().map(|s| s.packets.stats().bytes).sum();
        if total > buffering.max_queue_bytes {
            return BufferStatus::Full;
        }
        if streams
            .iter()
            .all(|s| s.has_enough_packets(buffering.min_frames, buffering.min_duration))
        {
            return BufferStatus::StreamsSatisfied;
        }
        BufferStatus::NotFull
    }

    /// Queue a coded unit on its stream
    ///
    /// Media units past the configured play range are dropped silently.
    pub fn feed(&self, unit: CodedUnit) -> Result<()> {
        let stream = self
            .stream(unit.stream)
            .ok_or(SyncError::StreamNotOpen(unit.stream))?;

        if !unit.is_flush() && !unit.is_end() && !self.in_play_range(&stream.params, &unit) {
            return Ok(());
        }

        stream.packets.put(unit).map_err(|_| SyncError::QueueAborted)
    }

    fn in_play_range(&self, params: &StreamParams, unit: &CodedUnit) -> bool {
        let Some(duration) = self.config.buffering.play_duration else {
            return true;
        };
        let Some(ts) = unit.pts.or(unit.dts) else {
            return true;
        };
        let start = self.config.buffering.start_time.unwrap_or(0.0);
        let offset = params.time_base.to_seconds(ts - params.start_time.unwrap_or(0));
        offset - start <= duration
    }

    /// Queue an end marker on every open stream
    pub fn feed_end_markers(&self) {
        for stream in self.open_streams() {
            // An aborted queue is being closed anyway
            let _ = stream.packets.put_end_marker(stream.kind());
        }
        debug!("End markers queued");
    }

    /// Start a new epoch on every open stream after a container seek
    ///
    /// `target` is the new position in seconds, `None` when unknown (byte
    /// seeks). The external clock restarts from the target.
    pub fn discard_and_flush(&self, target: Option<f64>, byte_mode: bool) {
        for stream in self.open_streams() {
            stream.packets.flush();
            let _ = stream.packets.put(CodedUnit::flush_marker(stream.kind()));
        }

        if byte_mode {
            self.external.set(None, 0);
        } else {
            self.external.set(target, 0);
        }

        info!(
            "Flushed all streams for seek to {}",
            crate::utils::format_seconds(target.filter(|_| !byte_mode))
        );

        if self.is_paused() {
            self.step_to_next_frame();
        }
    }

    /// Record a seek for the reader; ignored while another is pending
    pub fn seek(&self, target: f64, relative: f64, byte_mode: bool) -> bool {
        {
            let mut pending = self.seek.lock();
            if pending.is_some() {
                debug!("Seek to {} ignored, one already pending", target);
                return false;
            }
            *pending = Some(SeekRequest {
                target,
                relative,
                byte_mode,
            });
        }
        *self.last_seek_target.lock() = target;
        info!("Seek requested to {:.3}{}", target, if byte_mode { " (bytes)" } else { "" });
        self.wake_reader();
        true
    }

    /// Seek relative to the master clock (or the last seek target when the
    /// master clock is unknown), never before zero
    pub fn seek_relative(&self, increment: f64) -> bool {
        let position = self
            .get_master_clock()
            .unwrap_or_else(|| *self.last_seek_target.lock());
        let target = (position + increment).max(0.0);
        self.seek(target, increment, false)
    }

    /// Byte seek relative to the last presented unit
    ///
    /// `byte_rate` converts the increment from seconds to bytes.
    pub fn seek_relative_bytes(&self, increment: f64, byte_rate: Option<f64>) -> bool {
        let position = [StreamKind::Video, StreamKind::Audio]
            .iter()
            .filter_map(|kind| self.stream(*kind))
            .find_map(|stream| stream.frames.last_pos())
            .map(|pos| pos as f64)
            .unwrap_or_else(|| *self.last_seek_target.lock());
        let increment = increment * byte_rate.unwrap_or(180_000.0);
        self.seek((position + increment).max(0.0), increment, true)
    }

    /// Hand the pending seek to the reader
    pub fn take_seek_request(&self) -> Option<SeekRequest> {
        self.seek.lock().take()
    }

    /// The pending seek, left in place for the reader
    pub fn pending_seek(&self) -> Option<SeekRequest> {
        *self.seek.lock()
    }

    /// Wake a reader blocked in [`wait_for_reader_wakeup`](Self::wait_for_reader_wakeup)
    pub fn wake_reader(&self) {
        let mut flag = self.reader_wakeup.lock();
        *flag = true;
        self.reader_cond.notify_all();
    }

    /// Block the reader until woken or `timeout` elapses; true when woken
    pub fn wait_for_reader_wakeup(&self, timeout: Duration) -> bool {
        let mut flag = self.reader_wakeup.lock();
        if !*flag {
            self.reader_cond.wait_for(&mut flag, timeout);
        }
        std::mem::replace(&mut *flag, false)
    }

    // Pause, step and speed

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn toggle_pause(&self) {
        let mut pacing = self.pacing.lock();
        self.toggle_pause_locked(&mut pacing);
        pacing.step = false;
    }

    pub fn pause(&self) {
        let mut pacing = self.pacing.lock();
        if !self.is_paused() {
            self.toggle_pause_locked(&mut pacing);
        }
        pacing.step = false;
    }

    pub fn resume(&self) {
        let mut pacing = self.pacing.lock();
        if self.is_paused() {
            self.toggle_pause_locked(&mut pacing);
        }
        pacing.step = false;
    }

    pub(super) fn toggle_pause_locked(&self, pacing: &mut PacingState) {
        let paused = !self.is_paused();
        let video = self.stream(StreamKind::Video);

        if !paused {
            if let Some(video) = &video {
                // Shift the frame timer by the time spent paused
                pacing.frame_timer += self.time.now() - video.clock.last_updated();
            }
        }

        for stream in self.open_streams() {
            stream.clock.set_paused(paused);
        }
        self.external.set_paused(paused);
        self.paused.store(paused, Ordering::Release);
        info!("{}", if paused { "Paused" } else { "Resumed" });
    }

    /// Present exactly one more frame, then pause
    pub fn step_to_next_frame(&self) {
        let mut pacing = self.pacing.lock();
        if self.is_paused() {
            self.toggle_pause_locked(&mut pacing);
        }
        pacing.step = true;
    }

    pub fn is_stepping(&self) -> bool {
        self.pacing.lock().step
    }

    pub fn playback_speed(&self) -> f64 {
        *self.speed.lock()
    }

    /// Change playback rate of every clock without a jump
    pub fn set_speed(&self, speed: f64) -> Result<()> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(SyncError::InvalidInput(format!("Invalid playback speed {}", speed)));
        }

        let previous = std::mem::replace(&mut *self.speed.lock(), speed);
        let ratio = self.external.speed() / previous;
        for stream in self.open_streams() {
            stream.clock.set_speed(speed);
        }
        self.external.set_speed(speed * ratio);
        info!("Playback speed {:.2}x", speed);
        Ok(())
    }

    // Pacing helpers

    pub fn frame_timer(&self) -> f64 {
        self.pacing.lock().frame_timer
    }

    pub(super) fn max_frame_duration(&self) -> f64 {
        self.stream(StreamKind::Video)
            .map_or(3600.0, |video| video.params.max_frame_duration())
    }

    /// Frame delay corrected toward the master clock, in wall seconds
    pub fn compute_target_delay(&self, nominal: f64) -> f64 {
        let sync = &self.config.sync;
        let speed = self.playback_speed();
        let mut delay = nominal;

        if self.get_master_sync_type() != SyncMode::VideoMaster {
            let video = self.clock_time(StreamKind::Video);
            if let (Some(video), Some(master)) = (video, self.get_master_clock()) {
                let diff = video - master;
                let threshold =
                    delay.clamp(sync.threshold_min, sync.threshold_max) / speed.max(1.0);

                if diff.abs() < self.max_frame_duration() {
                    if diff <= -threshold {
                        delay = (delay + diff).max(0.0);
                    } else if diff >= threshold && delay > sync.framedup_threshold {
                        delay += diff;
                    } else if diff >= threshold {
                        delay *= 2.0;
                    }
                }
                trace!("video: delay={:.3} A-V={:.3}", delay, -diff);
            }
        }

        delay / speed
    }

    /// Late and early drops are allowed with the current master
    pub fn frame_drop_enabled(&self) -> bool {
        let video_is_master = self.get_master_sync_type() == SyncMode::VideoMaster;
        self.config.decoder.frame_drop.allows_drop(video_is_master)
    }

    // Status

    /// Every open audio/video stream has been decoded and presented to the end
    pub fn is_playback_finished(&self) -> bool {
        if self.is_paused() {
            return false;
        }
        let streams: Vec<_> = [StreamKind::Video, StreamKind::Audio]
            .iter()
            .filter_map(|kind| self.stream(*kind))
            .collect();
        !streams.is_empty() && streams.iter().all(|s| s.is_drained())
    }

    pub fn stats(&self) -> SyncStats {
        let audio = self.clock_time(StreamKind::Audio);
        let video = self.clock_time(StreamKind::Video);
        SyncStats {
            frames_displayed: self.counters.displayed.load(Ordering::Relaxed),
            late_drops: self.counters.late_drops.load(Ordering::Relaxed),
            early_drops: self.counters.early_drops.load(Ordering::Relaxed),
            audio_underruns: self.counters.underruns.load(Ordering::Relaxed),
            audio_corrections: self.counters.corrections.load(Ordering::Relaxed),
            master_clock: self.get_master_clock(),
            av_diff: audio.zip(video).map(|(a, v)| a - v),
            external_speed: self.external.speed(),
            paused: self.is_paused(),
        }
    }

    pub fn buffer_report(&self) -> BufferReport {
        let streams: Vec<StreamBufferInfo> = self
            .open_streams()
            .iter()
            .map(|s| StreamBufferInfo {
                kind: s.kind(),
                queue: s.packets.stats(),
                decoded: s.frames.remaining(),
                finished: s.status.finished_serial() == Some(s.packets.serial()),
            })
            .collect();
        BufferReport {
            status: self.is_buffer_full(),
            total_bytes: streams.iter().map(|s| s.queue.bytes).sum(),
            streams,
        }
    }

    /// Abort every stream
    pub fn shutdown(&self) {
        for kind in StreamKind::ALL {
            if self.is_open(kind) {
                let _ = self.close_stream(kind);
            }
        }
    }
}

impl EarlyDropGate for SyncCoordinator {
    fn early_drop_enabled(&self) -> bool {
        self.frame_drop_enabled()
    }

    fn master_time(&self) -> Option<f64> {
        self.get_master_clock()
    }

    fn video_clock_serial(&self) -> Option<u64> {
        self.stream(StreamKind::Video)?.clock.serial()
    }

    fn nosync_threshold(&self) -> f64 {
        self.config.sync.nosync_threshold
    }

    fn record_early_drop(&self) {
        self.counters.early_drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TimeBase;
    use crate::sync::ManualTimeSource;

    fn coordinator(config: Config) -> (Arc<ManualTimeSource>, SyncCoordinator) {
        let time = Arc::new(ManualTimeSource::new(1000.0));
        let coordinator = SyncCoordinator::new(config, time.clone());
        (time, coordinator)
    }

    fn video_params() -> StreamParams {
        StreamParams::video(TimeBase::new(1, 1000), 25.0)
    }

    fn audio_params() -> StreamParams {
        StreamParams::audio(TimeBase::new(1, 48_000), 48_000, 2)
    }

    fn media(kind: StreamKind, ms: i64) -> CodedUnit {
        CodedUnit::media(kind, vec![0; 100]).with_pts(ms).with_duration(40)
    }

    #[test]
    fn test_open_close() {
        let (_time, sync) = coordinator(Config::default());
        let video = sync.open_stream(video_params()).unwrap();
        assert_eq!(video.packets.serial(), 1);
        assert!(matches!(
            sync.open_stream(video_params()),
            Err(SyncError::StreamAlreadyOpen(StreamKind::Video))
        ));

        sync.close_stream(StreamKind::Video).unwrap();
        assert!(video.packets.is_aborted());
        assert!(matches!(
            sync.close_stream(StreamKind::Video),
            Err(SyncError::StreamNotOpen(StreamKind::Video))
        ));
    }

    #[test]
    fn test_master_downgrade() {
        let (_time, sync) = coordinator(Config::default());
        sync.set_master_sync(SyncMode::VideoMaster);
        assert_eq!(sync.get_master_sync_type(), SyncMode::ExternalMaster);

        sync.open_stream(audio_params()).unwrap();
        assert_eq!(sync.get_master_sync_type(), SyncMode::AudioMaster);

        sync.open_stream(video_params()).unwrap();
        assert_eq!(sync.get_master_sync_type(), SyncMode::VideoMaster);

        sync.set_master_sync(SyncMode::AudioMaster);
        sync.close_stream(StreamKind::Audio).unwrap();
        assert_eq!(sync.get_master_sync_type(), SyncMode::ExternalMaster);
    }

    #[test]
    fn test_master_clock_reads_selected_clock() {
        let (_time, sync) = coordinator(Config::default());
        let audio = sync.open_stream(audio_params()).unwrap();
        assert_eq!(sync.get_master_clock(), None);

        audio.clock.set(Some(12.5), audio.packets.serial());
        assert_eq!(sync.get_master_clock(), Some(12.5));

        sync.set_master_sync(SyncMode::ExternalMaster);
        assert_eq!(sync.get_master_clock(), None);
    }

    #[test]
    fn test_synchronize_audio_audio_master_is_identity() {
        let (_time, sync) = coordinator(Config::default());
        let audio = sync.open_stream(audio_params()).unwrap();
        audio.clock.set(Some(5.0), 1);
        for _ in 0..50 {
            assert_eq!(sync.synchronize_audio(1024), 1024);
        }
    }

    #[test]
    fn test_synchronize_audio_follows_external() {
        let (_time, sync) = coordinator(Config::default());
        sync.set_master_sync(SyncMode::ExternalMaster);
        let audio = sync.open_stream(audio_params()).unwrap();

        audio.clock.set(Some(10.05), 1);
        sync.external_clock().set(Some(10.0), 0);
        let mut wanted = 0;
        for _ in 0..30 {
            wanted = sync.synchronize_audio(1024);
        }
        assert_eq!(wanted, 1126);
        assert!(sync.stats().audio_corrections > 0);
    }

    #[test]
    fn test_buffer_full_by_bytes() {
        let mut config = Config::default();
        config.buffering.max_queue_bytes = 1000;
        let (_time, sync) = coordinator(config);
        sync.open_stream(video_params()).unwrap();

        assert_eq!(sync.is_buffer_full(), BufferStatus::NotFull);
        for i in 0..10 {
            sync.feed(media(StreamKind::Video, i * 40)).unwrap();
        }
        assert_eq!(sync.is_buffer_full(), BufferStatus::Full);
    }

    #[test]
    fn test_buffer_streams_satisfied() {
        let mut config = Config::default();
        config.buffering.min_frames = 5;
        config.buffering.min_duration = 0.1;
        let (_time, sync) = coordinator(config);
        sync.open_stream(video_params()).unwrap();
        sync.open_stream(audio_params()).unwrap();

        for i in 0..10 {
            sync.feed(media(StreamKind::Video, i * 40)).unwrap();
        }
        assert_eq!(sync.is_buffer_full(), BufferStatus::NotFull);

        for i in 0..10 {
            sync.feed(CodedUnit::media(StreamKind::Audio, vec![0; 10]).with_duration(1024).with_pts(i))
                .unwrap();
        }
        assert_eq!(sync.is_buffer_full(), BufferStatus::StreamsSatisfied);

        let report = sync.buffer_report();
        assert_eq!(report.status, BufferStatus::StreamsSatisfied);
        assert_eq!(report.streams.len(), 2);
    }

    #[test]
    fn test_infinite_buffer_for_realtime() {
        let mut config = Config::default();
        config.buffering.max_queue_bytes = 10;
        let (_time, sync) = coordinator(config);
        sync.open_stream(video_params().with_realtime(true)).unwrap();
        sync.feed(media(StreamKind::Video, 0)).unwrap();
        assert_eq!(sync.is_buffer_full(), BufferStatus::NotFull);
    }

    #[test]
    fn test_feed_requires_open_stream() {
        let (_time, sync) = coordinator(Config::default());
        assert!(matches!(
            sync.feed(media(StreamKind::Audio, 0)),
            Err(SyncError::StreamNotOpen(StreamKind::Audio))
        ));
    }

    #[test]
    fn test_play_range_filters_late_units() {
        let mut config = Config::default();
        config.buffering.play_duration = Some(1.0);
        let (_time, sync) = coordinator(config);
        let video = sync.open_stream(video_params()).unwrap();

        sync.feed(media(StreamKind::Video, 500)).unwrap();
        sync.feed(media(StreamKind::Video, 1000)).unwrap();
        sync.feed(media(StreamKind::Video, 1500)).unwrap();
        // flush marker from start() plus two in-range units
        assert_eq!(video.packets.len(), 3);
    }

    #[test]
    fn test_discard_and_flush_bumps_serial_once() {
        let (_time, sync) = coordinator(Config::default());
        let video = sync.open_stream(video_params()).unwrap();
        let audio = sync.open_stream(audio_params()).unwrap();
        sync.feed(media(StreamKind::Video, 0)).unwrap();

        sync.discard_and_flush(Some(30.0), false);
        assert_eq!(video.packets.serial(), 2);
        assert_eq!(audio.packets.serial(), 2);
        // only the new flush marker is left
        assert_eq!(video.packets.len(), 1);
        assert_eq!(sync.external_clock().now(), Some(30.0));
        assert_eq!(sync.external_clock().serial(), Some(0));

        sync.discard_and_flush(None, true);
        assert_eq!(video.packets.serial(), 3);
        assert_eq!(sync.external_clock().now(), None);
    }

    #[test]
    fn test_seek_request_handoff() {
        let (_time, sync) = coordinator(Config::default());
        assert!(sync.seek(10.0, 0.0, false));
        assert!(!sync.seek(20.0, 0.0, false));
        assert!(sync.wait_for_reader_wakeup(Duration::from_millis(1)));

        let request = sync.take_seek_request().unwrap();
        assert_eq!(request.target, 10.0);
        assert!(!request.byte_mode);
        assert!(sync.take_seek_request().is_none());

        // falls back to the last target when no clock is valid
        assert!(sync.seek_relative(-15.0));
        assert_eq!(sync.take_seek_request().unwrap().target, 0.0);
    }

    #[test]
    fn test_seek_relative_uses_master() {
        let (_time, sync) = coordinator(Config::default());
        let audio = sync.open_stream(audio_params()).unwrap();
        audio.clock.set(Some(42.0), 1);

        assert!(sync.seek_relative(10.0));
        let request = sync.take_seek_request().unwrap();
        assert_eq!(request.target, 52.0);
        assert_eq!(request.relative, 10.0);
    }

    #[test]
    fn test_reader_wakeup_times_out() {
        let (_time, sync) = coordinator(Config::default());
        assert!(!sync.wait_for_reader_wakeup(Duration::from_millis(5)));
        sync.wake_reader();
        assert!(sync.wait_for_reader_wakeup(Duration::from_millis(5)));
    }

    #[test]
    fn test_pause_resume_shifts_frame_timer() {
        let (time, sync) = coordinator(Config::default());
        let video = sync.open_stream(video_params()).unwrap();
        video.clock.set(Some(1.0), 1);
        let timer = sync.frame_timer();

        sync.toggle_pause();
        assert!(sync.is_paused());
        assert!(video.clock.is_paused());
        time.advance(3.0);
        assert_eq!(video.clock.now(), Some(1.0));

        sync.toggle_pause();
        assert!(!sync.is_paused());
        assert!((sync.frame_timer() - (timer + 3.0)).abs() < 1e-9);
        assert_eq!(video.clock.now(), Some(1.0));
    }

    #[test]
    fn test_step_unpauses_and_flags() {
        let (_time, sync) = coordinator(Config::default());
        sync.pause();
        sync.step_to_next_frame();
        assert!(!sync.is_paused());
        assert!(sync.is_stepping());

        sync.toggle_pause();
        assert!(sync.is_paused());
        assert!(!sync.is_stepping());
    }

    #[test]
    fn test_set_speed() {
        let (time, sync) = coordinator(Config::default());
        let video = sync.open_stream(video_params()).unwrap();
        video.clock.set(Some(0.0), 1);
        sync.set_speed(2.0).unwrap();
        time.advance(1.0);
        assert!((video.clock.now().unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(sync.external_clock().speed(), 2.0);
        assert!(sync.set_speed(0.0).is_err());
        assert!(sync.set_speed(f64::NAN).is_err());
    }

    #[test]
    fn test_external_clock_speed_adaptation() {
        let (_time, sync) = coordinator(Config::default());
        sync.open_stream(video_params().with_realtime(true)).unwrap();

        // Starved: only the start flush marker is queued
        sync.check_external_clock_speed();
        assert!((sync.external_clock().speed() - 0.999).abs() < 1e-9);

        for i in 0..20 {
            sync.feed(media(StreamKind::Video, i * 40)).unwrap();
        }
        sync.check_external_clock_speed();
        sync.check_external_clock_speed();
        assert!((sync.external_clock().speed() - 1.001).abs() < 1e-9);
        for _ in 0..50 {
            sync.check_external_clock_speed();
        }
        assert!((sync.external_clock().speed() - 1.010).abs() < 1e-9);
    }

    #[test]
    fn test_external_clock_decays_toward_normal() {
        let (_time, sync) = coordinator(Config::default());
        let video = sync.open_stream(video_params().with_realtime(true)).unwrap();
        for i in 0..5 {
            sync.feed(media(StreamKind::Video, i * 40)).unwrap();
        }
        assert_eq!(video.packets.len(), 6);

        sync.external_clock().set_speed(1.0025);
        sync.check_external_clock_speed();
        assert!((sync.external_clock().speed() - 1.0015).abs() < 1e-9);
        sync.check_external_clock_speed();
        sync.check_external_clock_speed();
        assert_eq!(sync.external_clock().speed(), 1.0);
    }

    #[test]
    fn test_compute_target_delay() {
        let (_time, sync) = coordinator(Config::default());
        let video = sync.open_stream(video_params()).unwrap();
        let audio = sync.open_stream(audio_params()).unwrap();

        // No valid clocks: nominal delay
        assert!((sync.compute_target_delay(0.04) - 0.04).abs() < 1e-9);

        audio.clock.set(Some(10.0), 1);
        video.clock.set(Some(10.0), 1);
        assert!((sync.compute_target_delay(0.04) - 0.04).abs() < 1e-9);

        // Within the threshold: untouched
        video.clock.set(Some(9.97), 1);
        assert!((sync.compute_target_delay(0.04) - 0.04).abs() < 1e-9);

        // Video behind: shorten
        video.clock.set(Some(9.8), 1);
        assert!((sync.compute_target_delay(0.5) - 0.3).abs() < 1e-9);
        video.clock.set(Some(9.9), 1);
        assert_eq!(sync.compute_target_delay(0.04), 0.0);

        // Video ahead with a short frame: duplicate
        video.clock.set(Some(10.05), 1);
        assert!((sync.compute_target_delay(0.04) - 0.08).abs() < 1e-9);

        // Video ahead with a long frame: one-shot correction
        video.clock.set(Some(10.2), 1);
        assert!((sync.compute_target_delay(0.5) - 0.7).abs() < 1e-9);

        // Beyond the max frame duration: leave alone
        video.clock.set(Some(5000.0), 1);
        assert!((sync.compute_target_delay(0.04) - 0.04).abs() < 1e-9);

        sync.set_master_sync(SyncMode::VideoMaster);
        video.clock.set(Some(9.0), 1);
        assert!((sync.compute_target_delay(0.04) - 0.04).abs() < 1e-9);
    }

    /// Run a worker over an end marker so the stream's epoch is finished
    fn drain_epoch(stream: &MediaStream) {
        use crate::decoder::{Codec, DecodeWorker, ReceiveStatus, ReorderPolicy, SendStatus};

        struct Drained(bool);
        impl Codec for Drained {
            fn send(&mut self, _unit: &CodedUnit) -> SendStatus {
                self.0 = true;
                SendStatus::Accepted
            }
            fn receive(&mut self) -> ReceiveStatus {
                if std::mem::replace(&mut self.0, false) {
                    ReceiveStatus::EndOfEpoch
                } else {
                    ReceiveStatus::NeedMoreInput
                }
            }
            fn flush(&mut self) {}
        }

        stream.packets.put_end_marker(stream.kind()).unwrap();
        let mut worker = DecodeWorker::new(
            Arc::clone(&stream.packets),
            Arc::clone(&stream.frames),
            Box::new(Drained(false)),
            VideoTiming::new(stream.params.time_base, ReorderPolicy::Auto, None),
            Arc::clone(&stream.status),
        );
        worker.decode_step().unwrap();
    }

    #[test]
    fn test_playback_finished() {
        let (_time, sync) = coordinator(Config::default());
        assert!(!sync.is_playback_finished());
        let video = sync.open_stream(video_params()).unwrap();
        assert!(!sync.is_playback_finished());

        drain_epoch(&video);
        assert!(sync.is_playback_finished());

        sync.pause();
        assert!(!sync.is_playback_finished());
    }

    #[test]
    fn test_stats_snapshot() {
        let (_time, sync) = coordinator(Config::default());
        let video = sync.open_stream(video_params()).unwrap();
        let audio = sync.open_stream(audio_params()).unwrap();
        video.clock.set(Some(3.0), 1);
        audio.clock.set(Some(3.25), 1);
        sync.record_underrun();

        let stats = sync.stats();
        assert_eq!(stats.audio_underruns, 1);
        assert_eq!(stats.master_clock, Some(3.25));
        assert!((stats.av_diff.unwrap() - 0.25).abs() < 1e-9);
        assert_eq!(stats.external_speed, 1.0);
    }
}
