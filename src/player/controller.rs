//! Player controller implementation for avsync
//!
//! `PlayerController` owns the [`SyncCoordinator`], one decode thread per
//! open stream and the optional pacing thread that drives
//! [`SyncCoordinator::video_refresh`]. The application keeps the reader
//! (demuxer) loop and the audio device callback; it feeds coded units
//! through [`PlayerController::feed`] and serves the device from an
//! [`AudioPump`].

use crate::audio::{AudioLevels, AudioOutput, AudioPump};
use crate::decoder::{
    AudioTiming, Codec, CodedUnit, DecodeWorker, MediaTiming, StreamKind, StreamParams,
    SubtitleTiming,
};
use crate::player::{PlaybackState, PlayerEvent, PlayerEventHandler};
use crate::renderer::VideoRenderer;
use crate::sync::{
    BufferReport, BufferStatus, MediaStream, SeekRequest, SyncCoordinator, SyncMode, SyncStats,
    SystemTimeSource, TimeSource,
};
use crate::utils::config::Config;
use crate::utils::error::{Result, SyncError};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Fan-out of player events to handlers and channel subscribers
#[derive(Default)]
struct EventDispatcher {
    handlers: Mutex<Vec<Box<dyn PlayerEventHandler>>>,
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl EventDispatcher {
    fn emit(&self, event: PlayerEvent) {
        debug!("Player event: {:?}", event);
        for handler in self.handlers.lock().iter_mut() {
            handler.handle_event(&event);
        }
        // Dropped receivers unsubscribe themselves
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Main player controller
pub struct PlayerController {
    sync: Arc<SyncCoordinator>,
    levels: Arc<AudioLevels>,
    events: Arc<EventDispatcher>,

    workers: Mutex<Vec<(StreamKind, JoinHandle<()>)>>,
    pacing_thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,

    /// `EndOfMedia` already emitted for the current position
    end_reported: Arc<AtomicBool>,
}

impl PlayerController {
    /// Create a controller running on the system monotonic clock
    pub fn new(config: Config) -> Result<Self> {
        Self::with_time_source(config, Arc::new(SystemTimeSource::new()))
    }

    /// Create a controller on an explicit time source
    pub fn with_time_source(config: Config, time: Arc<dyn TimeSource>) -> Result<Self> {
        config.validate()?;
        let levels = Arc::new(AudioLevels::new(config.audio.volume, config.audio.muted));
        Ok(Self {
            sync: Arc::new(SyncCoordinator::new(config, time)),
            levels,
            events: Arc::new(EventDispatcher::default()),
            workers: Mutex::new(Vec::new()),
            pacing_thread: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
            end_reported: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared synchronization state
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    // Streams

    /// Open a stream and start its decode worker
    ///
    /// # Arguments
    ///
    /// * `params` - Stream timing parameters
    /// * `codec` - Codec that decodes this stream's units
    pub fn open_stream(&self, params: StreamParams, codec: Box<dyn Codec>) -> Result<()> {
        let kind = params.kind;
        let stream = self.sync.open_stream(params)?;

        let spawned = match kind {
            StreamKind::Video => {
                let timing = self.sync.video_timing(&stream.params);
                self.spawn_worker(&stream, codec, timing)
            }
            StreamKind::Audio => {
                let timing = AudioTiming::new(stream.params.time_base, stream.params.start_time);
                self.spawn_worker(&stream, codec, timing)
            }
            StreamKind::Subtitle => {
                let timing = SubtitleTiming::new(stream.params.time_base);
                self.spawn_worker(&stream, codec, timing)
            }
        };

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.sync.close_stream(kind);
                return Err(e);
            }
        };

        let mut workers = self.workers.lock();
        // A previous worker of this kind has already exited
        if let Some(index) = workers.iter().position(|(k, _)| *k == kind) {
            let (_, old) = workers.swap_remove(index);
            let _ = old.join();
        }
        workers.push((kind, handle));
        drop(workers);

        self.end_reported.store(false, Ordering::Release);
        self.events.emit(PlayerEvent::StreamOpened { kind });
        Ok(())
    }

    fn spawn_worker<T: MediaTiming + 'static>(
        &self,
        stream: &Arc<MediaStream>,
        codec: Box<dyn Codec>,
        timing: T,
    ) -> Result<JoinHandle<()>> {
        let kind = stream.kind();
        let waker = Arc::clone(&self.sync);
        let worker = DecodeWorker::new(
            Arc::clone(&stream.packets),
            Arc::clone(&stream.frames),
            codec,
            timing,
            Arc::clone(&stream.status),
        )
        .on_drained(move || waker.wake_reader());

        let sync = Arc::clone(&self.sync);
        let events = Arc::clone(&self.events);
        let stream = Arc::clone(stream);
        let handle = thread::Builder::new()
            .name(format!("{}-decoder", kind))
            .spawn(move || {
                if let Err(e) = worker.run() {
                    error!("Closing {} stream: {}", kind, e);
                    // Only close the stream this worker was serving
                    let current = sync.stream(kind).is_some_and(|s| Arc::ptr_eq(&s, &stream));
                    if current {
                        let _ = sync.close_stream(kind);
                        events.emit(PlayerEvent::StreamClosed {
                            kind,
                            reason: Some(e.to_string()),
                        });
                    }
                }
            })?;
        Ok(handle)
    }

    /// Close a stream and join its decode worker
    pub fn close_stream(&self, kind: StreamKind) -> Result<()> {
        self.sync.close_stream(kind)?;
        let handle = {
            let mut workers = self.workers.lock();
            workers
                .iter()
                .position(|(k, _)| *k == kind)
                .map(|index| workers.swap_remove(index).1)
        };
        let panicked = handle.is_some_and(|handle| handle.join().is_err());
        if panicked {
            let err = crate::internal_error!("{} decode worker panicked", kind);
            self.events.emit(PlayerEvent::StreamClosed {
                kind,
                reason: Some(err.to_string()),
            });
            return Err(err);
        }
        self.events.emit(PlayerEvent::StreamClosed { kind, reason: None });
        Ok(())
    }

    pub fn is_open(&self, kind: StreamKind) -> bool {
        self.sync.is_open(kind)
    }

    // Reader side

    /// Queue a coded unit read from the container
    pub fn feed(&self, unit: CodedUnit) -> Result<()> {
        self.sync.feed(unit)
    }

    /// Signal end of input on every open stream
    pub fn feed_end_markers(&self) {
        self.sync.feed_end_markers();
    }

    pub fn is_buffer_full(&self) -> BufferStatus {
        self.sync.is_buffer_full()
    }

    /// Take the pending seek; the reader seeks the container, then calls
    /// [`discard_and_flush`](Self::discard_and_flush)
    pub fn take_seek_request(&self) -> Option<SeekRequest> {
        self.sync.take_seek_request()
    }

    pub fn discard_and_flush(&self, target: Option<f64>, byte_mode: bool) {
        self.end_reported.store(false, Ordering::Release);
        self.sync.discard_and_flush(target, byte_mode);
    }

    /// Block the reader until a worker drains its queue, a seek arrives or
    /// `timeout` elapses
    pub fn wait_for_reader_wakeup(&self, timeout: Duration) -> bool {
        self.sync.wait_for_reader_wakeup(timeout)
    }

    // Playback control

    pub fn play(&self) {
        if self.sync.is_paused() {
            self.sync.resume();
            self.events.emit(PlayerEvent::PlaybackStarted);
        }
    }

    pub fn pause(&self) {
        if !self.sync.is_paused() {
            self.sync.pause();
            self.events.emit(PlayerEvent::PlaybackPaused);
        }
    }

    pub fn toggle_pause(&self) {
        if self.sync.is_paused() {
            self.play();
        } else {
            self.pause();
        }
    }

    /// Show one more frame, then pause
    pub fn step_frame(&self) {
        self.sync.step_to_next_frame();
    }

    /// Request a seek to `target` seconds; false if one is already pending
    pub fn seek(&self, target: f64) -> Result<bool> {
        if !target.is_finite() || target < 0.0 {
            return Err(SyncError::InvalidInput(format!("Invalid seek target {}", target)));
        }
        let relative = self.sync.get_master_clock().map_or(0.0, |now| target - now);
        let accepted = self.sync.seek(target, relative, false);
        Ok(self.after_seek(accepted))
    }

    /// Seek `increment` seconds from the current position
    pub fn seek_relative(&self, increment: f64) -> bool {
        let accepted = self.sync.seek_relative(increment);
        self.after_seek(accepted)
    }

    /// Seek by bytes, converting `increment` seconds with `byte_rate`
    pub fn seek_relative_bytes(&self, increment: f64, byte_rate: Option<f64>) -> bool {
        let accepted = self.sync.seek_relative_bytes(increment, byte_rate);
        self.after_seek(accepted)
    }

    fn after_seek(&self, accepted: bool) -> bool {
        if accepted {
            self.end_reported.store(false, Ordering::Release);
            // The reader may already have taken it
            if let Some(request) = self.sync.pending_seek() {
                self.events.emit(PlayerEvent::SeekRequested {
                    target: request.target,
                    byte_mode: request.byte_mode,
                });
            }
        }
        accepted
    }

    pub fn set_speed(&self, speed: f64) -> Result<()> {
        self.sync.set_speed(speed)?;
        self.events.emit(PlayerEvent::SpeedChanged { speed });
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        self.sync.playback_speed()
    }

    pub fn set_master_sync(&self, mode: SyncMode) {
        if self.sync.preferred_sync_type() != mode {
            self.sync.set_master_sync(mode);
            self.events.emit(PlayerEvent::MasterChanged { mode });
        }
    }

    // Queries

    /// Current master clock value, `None` while unknown
    pub fn query_master_clock_time(&self) -> Option<f64> {
        self.sync.get_master_clock()
    }

    pub fn query_buffer_status(&self) -> BufferReport {
        self.sync.buffer_report()
    }

    pub fn stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub fn state(&self) -> PlaybackState {
        if !StreamKind::ALL.iter().any(|kind| self.sync.is_open(*kind)) {
            PlaybackState::Idle
        } else if self.sync.is_paused() {
            PlaybackState::Paused
        } else if self.sync.is_playback_finished() {
            PlaybackState::Ended
        } else {
            PlaybackState::Playing
        }
    }

    // Presentation

    /// Start the pacing thread presenting video (and subtitles) on `renderer`
    pub fn start_pacing(&self, renderer: Box<dyn VideoRenderer>) -> Result<()> {
        let mut slot = self.pacing_thread.lock();
        if slot.is_some() {
            return Err(SyncError::InvalidInput("Pacing already running".to_string()));
        }

        let sync = Arc::clone(&self.sync);
        let events = Arc::clone(&self.events);
        let running = Arc::clone(&self.running);
        let end_reported = Arc::clone(&self.end_reported);
        let mut renderer = renderer;

        *slot = Some(
            thread::Builder::new()
                .name("video-pacing".to_string())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        let remaining = sync.video_refresh(renderer.as_mut());
                        if sync.is_playback_finished() && !end_reported.swap(true, Ordering::AcqRel) {
                            info!("End of media");
                            events.emit(PlayerEvent::EndOfMedia);
                        }
                        thread::sleep(remaining);
                    }
                    debug!("Pacing thread stopped");
                })?,
        );
        Ok(())
    }

    /// Build the audio-callback side for the open audio stream
    pub fn audio_pump(&self, output: Box<dyn AudioOutput>) -> Result<AudioPump> {
        AudioPump::new(Arc::clone(&self.sync), output, Arc::clone(&self.levels))
    }

    // Volume

    pub fn set_volume(&self, volume: f32) {
        self.levels.set_volume(volume);
        self.events.emit(PlayerEvent::VolumeChanged {
            volume: self.levels.volume(),
        });
    }

    pub fn volume(&self) -> f32 {
        self.levels.volume()
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = self.levels.toggle_mute();
        self.events.emit(PlayerEvent::MuteChanged { muted });
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.levels.is_muted()
    }

    // Events

    pub fn add_event_handler(&self, handler: Box<dyn PlayerEventHandler>) {
        self.events.handlers.lock().push(handler);
    }

    /// Receive every event emitted from now on
    pub fn subscribe_events(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.events.subscribers.lock().push(tx);
        rx
    }

    /// Stop all threads and abort every stream
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.sync.shutdown();

        if let Some(handle) = self.pacing_thread.lock().take() {
            let _ = handle.join();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for (kind, handle) in workers {
            if handle.join().is_err() {
                warn!("{} decode worker panicked", kind);
            }
        }
        info!("Player shut down");
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
