//! Configuration management for avsync
//!
//! Every tuning constant used by the synchronization algorithms lives here
//! with its reference default. Values can be overridden from TOML files and
//! environment variables.

use crate::decoder::{FrameDropPolicy, ReorderPolicy, StreamKind};
use crate::sync::SyncMode;
use crate::utils::error::{IntoSyncError, Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Clock and pacing parameters
    pub sync: SyncConfig,

    /// Decode worker parameters
    pub decoder: DecoderConfig,

    /// Reader buffering policy
    pub buffering: BufferConfig,

    /// Audio output parameters
    pub audio: AudioConfig,

    /// General settings
    pub general: GeneralConfig,
}

/// Synchronization tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Preferred master clock
    pub mode: SyncMode,

    /// Lower bound of the video sync threshold in seconds
    pub threshold_min: f64,

    /// Upper bound of the video sync threshold in seconds
    pub threshold_max: f64,

    /// Frames longer than this are corrected in one shot instead of duplicated
    pub framedup_threshold: f64,

    /// Clock differences at or above this are treated as discontinuities
    pub nosync_threshold: f64,

    /// Nominal duration used for the very first frame
    pub first_frame_duration: f64,

    /// Default refresh interval handed back by the pacing tick
    pub refresh_rate: f64,

    /// Warm-up window of the audio drift average
    pub audio_diff_avg_nb: u32,

    /// Maximum audio sample-count correction, in percent
    pub sample_correction_percent_max: u32,

    /// External clock speed bounds and step
    pub external_speed_min: f64,
    pub external_speed_max: f64,
    pub external_speed_step: f64,

    /// Packet-count water marks for external clock adaptation
    pub external_min_frames: usize,
    pub external_max_frames: usize,
}

/// Decode worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Video timestamp selection
    pub reorder_pts: ReorderPolicy,

    /// Early/late frame dropping
    pub frame_drop: FrameDropPolicy,

    /// Decoded ring capacities
    pub video_queue_size: usize,
    pub audio_queue_size: usize,
    pub subtitle_queue_size: usize,
}

/// Reader buffering configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Hard cap on queued bytes across all streams
    pub max_queue_bytes: usize,

    /// A stream has enough data above this many queued packets...
    pub min_frames: usize,

    /// ...and above this much queued duration in seconds (when known)
    pub min_duration: f64,

    /// Never report the buffer as full; `None` means "only for realtime sources"
    pub infinite_buffer: Option<bool>,

    /// Start of the play range in seconds
    pub start_time: Option<f64>,

    /// Length of the play range in seconds
    pub play_duration: Option<f64>,
}

/// Audio output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Hardware buffer size in samples per channel
    pub hw_buffer_samples: usize,

    /// Initial volume (0.0 - 1.0)
    pub volume: f32,

    /// Start muted
    pub muted: bool,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::AudioMaster,
            threshold_min: 0.04,
            threshold_max: 0.1,
            framedup_threshold: 0.1,
            nosync_threshold: 10.0,
            first_frame_duration: 0.01,
            refresh_rate: 0.01,
            audio_diff_avg_nb: 20,
            sample_correction_percent_max: 10,
            external_speed_min: 0.900,
            external_speed_max: 1.010,
            external_speed_step: 0.001,
            external_min_frames: 2,
            external_max_frames: 10,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            reorder_pts: ReorderPolicy::Auto,
            frame_drop: FrameDropPolicy::Auto,
            video_queue_size: 3,
            audio_queue_size: 9,
            subtitle_queue_size: 16,
        }
    }
}

impl DecoderConfig {
    /// Ring capacity for a stream kind
    pub fn queue_size(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Video => self.video_queue_size,
            StreamKind::Audio => self.audio_queue_size,
            StreamKind::Subtitle => self.subtitle_queue_size,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_queue_bytes: 15 * 1024 * 1024,
            min_frames: 25,
            min_duration: 1.0,
            infinite_buffer: None,
            start_time: None,
            play_duration: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            hw_buffer_samples: 1024,
            volume: 1.0,
            muted: false,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. System config file (/etc/avsync/config.toml on Linux)
    /// 3. User config file (~/.config/avsync/config.toml on Linux)
    /// 4. `explicit`, when given
    /// 5. Environment variables (AVSYNC_* prefix)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut layers: Vec<PathBuf> = [Self::system_config_path(), Self::user_config_path()]
            .into_iter()
            .flatten()
            .filter(|path| path.exists())
            .collect();
        if let Some(path) = explicit {
            layers.push(path.to_path_buf());
        }

        let mut config = Self::from_layers(&layers)?;
        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_layers(&[path])
    }

    /// Merge TOML files over the defaults, later files winning key by key
    pub fn from_layers<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = toml::Value::try_from(Self::default()).config_err("Failed to serialize defaults")?;

        for path in paths {
            let path = path.as_ref();
            let contents = std::fs::read_to_string(path)
                .config_err(&format!("Failed to read {}", path.display()))?;
            let layer: toml::Value =
                toml::from_str(&contents).config_err(&format!("Failed to parse {}", path.display()))?;
            merge_toml(&mut merged, layer);
        }

        merged.try_into().config_err("Invalid configuration")
    }

    /// Serialize to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).config_err("Failed to serialize config")
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("AVSYNC_SYNC_MODE") {
            self.sync.mode = mode.parse()?;
        }

        if let Ok(policy) = std::env::var("AVSYNC_FRAME_DROP") {
            self.decoder.frame_drop = policy.parse()?;
        }

        if let Ok(infinite) = std::env::var("AVSYNC_INFINITE_BUFFER") {
            let value = infinite
                .parse::<bool>()
                .config_err("Invalid AVSYNC_INFINITE_BUFFER")?;
            self.buffering.infinite_buffer = Some(value);
        }

        if let Ok(log_level) = std::env::var("AVSYNC_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;

        if sync.threshold_min <= 0.0 || sync.threshold_min > sync.threshold_max {
            return Err(SyncError::Config(
                "Sync thresholds must satisfy 0 < threshold_min <= threshold_max".to_string(),
            ));
        }

        if sync.nosync_threshold <= sync.threshold_max {
            return Err(SyncError::Config(
                "nosync_threshold must exceed threshold_max".to_string(),
            ));
        }

        if sync.audio_diff_avg_nb == 0 {
            return Err(SyncError::Config("audio_diff_avg_nb must be non-zero".to_string()));
        }

        if sync.sample_correction_percent_max >= 100 {
            return Err(SyncError::Config(
                "sample_correction_percent_max must be below 100".to_string(),
            ));
        }

        if !(sync.external_speed_min <= 1.0 && 1.0 <= sync.external_speed_max) {
            return Err(SyncError::Config(
                "External clock speed range must contain 1.0".to_string(),
            ));
        }

        for kind in StreamKind::ALL {
            // Video and audio rings hold the last shown unit besides the pending ones
            let min = if kind == StreamKind::Subtitle { 1 } else { 2 };
            if self.decoder.queue_size(kind) < min {
                return Err(SyncError::Config(format!(
                    "{} queue size must be at least {}",
                    kind, min
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.audio.volume) {
            return Err(SyncError::Config("Audio volume must be between 0.0 and 1.0".to_string()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(SyncError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/avsync/config.toml"));

        #[cfg(target_os = "windows")]
        return std::env::var("PROGRAMDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("avsync").join("config.toml"));

        #[cfg(target_os = "macos")]
        return Some(PathBuf::from("/Library/Application Support/avsync/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("avsync").join("config.toml"))
    }
}

/// Overlay `layer` onto `base`, recursing into tables
fn merge_toml(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
