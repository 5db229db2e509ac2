//! avsync - audio/video synchronization core
//!
//! Coded units flow from the application's reader into per-stream
//! [`decoder::PacketQueue`]s, decode workers turn them into decoded units
//! in bounded [`decoder::FrameQueue`] rings, and the
//! [`sync::SyncCoordinator`] presents them against a master clock: video
//! through a pacing tick, audio through the device callback.
//!
//! Decompression, demuxing and device output are collaborators supplied by
//! the application through [`decoder::Codec`], [`renderer::VideoRenderer`]
//! and [`audio::AudioOutput`].

pub mod audio;
pub mod decoder;
pub mod player;
pub mod renderer;
pub mod sync;
pub mod utils;

pub use audio::{AudioLevels, AudioOutput, AudioPump};
pub use decoder::{Codec, CodedUnit, DecodedUnit, StreamKind, StreamParams, TimeBase};
pub use player::{PlaybackState, PlayerController, PlayerEvent, PlayerEventHandler};
pub use renderer::{HeadlessRenderer, VideoRenderer};
pub use sync::{Clock, SyncCoordinator, SyncMode};
pub use utils::config::Config;
pub use utils::error::{Result, SyncError};
