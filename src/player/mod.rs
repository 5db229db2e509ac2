//! Player controller module for avsync
//!
//! This module exposes the control surface an application drives: opening
//! and closing streams with their decode workers, feeding coded units,
//! play/pause/seek/speed/step, volume, and event notification. The
//! synchronization itself lives in [`crate::sync`].

mod controller;

pub use controller::PlayerController;

use crate::decoder::StreamKind;
use crate::sync::SyncMode;

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No stream open
    Idle,

    /// Clocks running
    Playing,

    /// Clocks frozen
    Paused,

    /// Every open stream decoded and presented to its end
    Ended,
}

/// Player event for external event handling
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Stream queues created and decode worker started
    StreamOpened { kind: StreamKind },

    /// Stream closed; `reason` is set when a worker failed
    StreamClosed {
        kind: StreamKind,
        reason: Option<String>,
    },

    /// Playback started or resumed
    PlaybackStarted,

    /// Playback paused
    PlaybackPaused,

    /// Seek handed to the reader
    SeekRequested { target: f64, byte_mode: bool },

    /// Playback speed changed
    SpeedChanged { speed: f64 },

    /// Preferred master clock changed
    MasterChanged { mode: SyncMode },

    /// Volume changed
    VolumeChanged { volume: f32 },

    /// Mute toggled
    MuteChanged { muted: bool },

    /// End of media reached
    EndOfMedia,
}

/// Player event handler trait
pub trait PlayerEventHandler: Send {
    /// Handle player event
    ///
    /// # Arguments
    ///
    /// * `event` - Player event
    fn handle_event(&mut self, event: &PlayerEvent);
}
