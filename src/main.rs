use anyhow::{Context, Result};
use avsync::decoder::{
    Codec, CodedUnit, FrameData, Geometry, RawFrame, ReceiveStatus, SendStatus, StreamKind,
    StreamParams, TimeBase,
};
use avsync::renderer::HeadlessRenderer;
use avsync::sync::{BufferStatus, SyncMode};
use avsync::{AudioOutput, DecodedUnit, PlaybackState, PlayerController, PlayerEvent};
use clap::Parser;
use env_logger::Env;
use log::{debug, error, info};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// avsync demo - plays a synthetic audio/video session against the system clock
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Length of the synthetic media in seconds
    #[arg(short = 't', long, default_value = "6")]
    duration: f64,

    /// Video frame rate
    #[arg(long, default_value = "25")]
    fps: u32,

    /// Audio sample rate
    #[arg(long, default_value = "48000")]
    sample_rate: u32,

    /// Master clock: audio, video or external
    #[arg(short, long, value_name = "MODE")]
    sync: Option<SyncMode>,

    /// Playback speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Seek to this position two seconds into playback
    #[arg(long, value_name = "SECONDS")]
    seek: Option<f64>,

    /// Configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = avsync::utils::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(mode) = args.sync {
        config.sync.mode = mode;
    }

    // Initialize logging
    let log_level = if args.debug { "debug".to_string() } else { config.general.log_level.clone() };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting avsync demo v{}", env!("CARGO_PKG_VERSION"));

    let hw_buffer = config.audio.hw_buffer_samples;
    let player = Arc::new(PlayerController::new(config)?);
    player.add_event_handler(Box::new(LoggingEventHandler));
    player.set_speed(args.speed)?;

    let source = SyntheticSource::new(args.duration, args.fps, args.sample_rate);
    player.open_stream(
        StreamParams::video(TimeBase::new(1, args.fps as i32), args.fps as f64),
        Box::new(SyntheticCodec::new(StreamKind::Video, args.sample_rate)),
    )?;
    player.open_stream(
        StreamParams::audio(TimeBase::new(1, args.sample_rate as i32), args.sample_rate, 2),
        Box::new(SyntheticCodec::new(StreamKind::Audio, args.sample_rate)),
    )?;
    player.start_pacing(Box::new(HeadlessRenderer::new()))?;

    // Reader
    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let player = Arc::clone(&player);
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || run_reader(&player, source, &stop))
    };

    // Audio device callback, simulated with a timer
    let samples_out = Arc::new(AtomicU64::new(0));
    let mut pump = player.audio_pump(Box::new(NullAudioOutput {
        samples: Arc::clone(&samples_out),
    }))?;
    let sample_rate = args.sample_rate;
    let audio = tokio::spawn(async move {
        let period = Duration::from_secs_f64(hw_buffer as f64 / sample_rate as f64);
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            pump.fill(hw_buffer);
        }
    });

    let started = Instant::now();
    let limit = Duration::from_secs_f64(args.duration / args.speed + 10.0);
    let mut pending_seek = args.seek;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        let stats = player.stats();
        info!(
            "{} A-V={} displayed={} late={} early={} underruns={} corrections={}",
            avsync::utils::format_seconds(stats.master_clock),
            stats.av_diff.map_or("n/a".to_string(), |d| format!("{:+.3}", d)),
            stats.frames_displayed,
            stats.late_drops,
            stats.early_drops,
            stats.audio_underruns,
            stats.audio_corrections,
        );

        if started.elapsed() >= Duration::from_secs(2) {
            if let Some(target) = pending_seek.take() {
                player.seek(target)?;
            }
        }
        if player.state() == PlaybackState::Ended {
            break;
        }
        if started.elapsed() > limit {
            error!("Playback did not finish in {:?}", limit);
            break;
        }
    }

    stop.store(true, Ordering::Release);
    audio.abort();
    player.shutdown();
    match reader.await? {
        Ok(()) => {}
        Err(e) if e.is_aborted() => debug!("Reader stopped by shutdown"),
        Err(e) => return Err(e.into()),
    }

    info!(
        "Done: {} frames displayed, {} audio samples played",
        player.stats().frames_displayed,
        samples_out.load(Ordering::Relaxed)
    );
    Ok(())
}

/// Reader loop: feeds coded units while the buffer has room and serves seeks
fn run_reader(
    player: &PlayerController,
    mut source: SyntheticSource,
    stop: &AtomicBool,
) -> avsync::Result<()> {
    let mut ended = false;
    while !stop.load(Ordering::Acquire) {
        if let Some(request) = player.take_seek_request() {
            let seconds = if request.byte_mode {
                request.target / source.byte_rate()
            } else {
                request.target
            };
            source.seek(seconds);
            player.discard_and_flush(Some(seconds).filter(|_| !request.byte_mode), request.byte_mode);
            ended = false;
            continue;
        }

        if ended || player.is_buffer_full() != BufferStatus::NotFull {
            player.wait_for_reader_wakeup(Duration::from_millis(10));
            continue;
        }

        match source.next_unit() {
            Some(unit) => player.feed(unit)?,
            None => {
                player.feed_end_markers();
                ended = true;
            }
        }
    }
    Ok(())
}

/// Interleaved video and audio units of a fixed-length synthetic clip
struct SyntheticSource {
    duration: f64,
    fps: u32,
    sample_rate: u32,
    samples_per_unit: i64,
    next_video: i64,
    next_audio: i64,
}

const VIDEO_UNIT_BYTES: usize = 4096;
const AUDIO_UNIT_BYTES: usize = 512;

impl SyntheticSource {
    fn new(duration: f64, fps: u32, sample_rate: u32) -> Self {
        Self {
            duration,
            fps,
            sample_rate,
            samples_per_unit: 1024,
            next_video: 0,
            next_audio: 0,
        }
    }

    fn video_time(&self) -> f64 {
        self.next_video as f64 / self.fps as f64
    }

    fn audio_time(&self) -> f64 {
        (self.next_audio * self.samples_per_unit) as f64 / self.sample_rate as f64
    }

    /// Container bytes per second of media
    fn byte_rate(&self) -> f64 {
        let audio_units = self.sample_rate as f64 / self.samples_per_unit as f64;
        self.fps as f64 * VIDEO_UNIT_BYTES as f64 + audio_units * AUDIO_UNIT_BYTES as f64
    }

    fn seek(&mut self, seconds: f64) {
        let seconds = seconds.clamp(0.0, self.duration);
        self.next_video = (seconds * self.fps as f64).floor() as i64;
        self.next_audio =
            (seconds * self.sample_rate as f64 / self.samples_per_unit as f64).floor() as i64;
    }

    fn next_unit(&mut self) -> Option<CodedUnit> {
        let video_time = self.video_time();
        let audio_time = self.audio_time();
        let video_left = video_time < self.duration;
        let audio_left = audio_time < self.duration;

        if video_left && (!audio_left || video_time <= audio_time) {
            let pts = self.next_video;
            self.next_video += 1;
            let pos = (video_time * self.byte_rate()) as i64;
            Some(
                CodedUnit::media(StreamKind::Video, vec![0; VIDEO_UNIT_BYTES])
                    .with_pts(pts)
                    .with_dts(pts)
                    .with_duration(1)
                    .with_pos(pos),
            )
        } else if audio_left {
            let pts = self.next_audio * self.samples_per_unit;
            self.next_audio += 1;
            let pos = (audio_time * self.byte_rate()) as i64;
            Some(
                CodedUnit::media(StreamKind::Audio, vec![0; AUDIO_UNIT_BYTES])
                    .with_pts(pts)
                    .with_duration(self.samples_per_unit)
                    .with_pos(pos),
            )
        } else {
            None
        }
    }
}

/// Codec that turns each unit into a gray picture or a silent audio block
struct SyntheticCodec {
    kind: StreamKind,
    sample_rate: u32,
    output: VecDeque<RawFrame>,
    draining: bool,
    pool: Vec<Vec<u8>>,
}

impl SyntheticCodec {
    const WIDTH: u32 = 64;
    const HEIGHT: u32 = 36;

    fn new(kind: StreamKind, sample_rate: u32) -> Self {
        Self {
            kind,
            sample_rate,
            output: VecDeque::new(),
            draining: false,
            pool: Vec::new(),
        }
    }

    fn picture(&mut self) -> (FrameData, Geometry) {
        let len = (Self::WIDTH * Self::HEIGHT * 4) as usize;
        let mut data = self.pool.pop().unwrap_or_default();
        data.clear();
        data.resize(len, 0x80);
        (
            FrameData::Packed {
                data,
                stride: Self::WIDTH as usize * 4,
            },
            Geometry::Picture {
                width: Self::WIDTH,
                height: Self::HEIGHT,
                sar: 1.0,
            },
        )
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
                let samples = unit.duration.unwrap_or(1024) as usize;
                (
                    FrameData::Samples(vec![0.0; samples * 2]),
                    Geometry::Audio {
                        sample_rate: self.sample_rate,
                        channels: 2,
                        samples,
                    },
                )
            }
            _ => self.picture(),
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

    fn recycle(&mut self, data: FrameData) {
        if let FrameData::Packed { data, .. } = data {
            self.pool.push(data);
        }
    }
}

/// Audio output that discards samples and counts them
struct NullAudioOutput {
    samples: Arc<AtomicU64>,
}

impl AudioOutput for NullAudioOutput {
    fn output_audio(&mut self, _unit: &DecodedUnit, wanted_samples: usize, _volume: f32, _muted: bool) {
        self.samples.fetch_add(wanted_samples as u64, Ordering::Relaxed);
    }

    fn output_silence(&mut self, _samples: usize) {}
}

/// Event handler that logs events
struct LoggingEventHandler;

impl avsync::PlayerEventHandler for LoggingEventHandler {
    fn handle_event(&mut self, event: &PlayerEvent) {
        match event {
            PlayerEvent::StreamOpened { kind } => info!("Opened {} stream", kind),
            PlayerEvent::StreamClosed { kind, reason: Some(reason) } => {
                error!("{} stream closed: {}", kind, reason)
            }
            PlayerEvent::SeekRequested { target, .. } => info!("Seeking to {:.2}s", target),
            PlayerEvent::EndOfMedia => info!("End of media reached"),
            _ => debug!("{:?}", event),
        }
    }
}
