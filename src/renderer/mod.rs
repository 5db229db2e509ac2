//! Renderer module for avsync
//!
//! The synchronization core never touches pixels. It decides which decoded
//! video unit to show and when, then hands it to a [`VideoRenderer`]
//! supplied by the application.

use crate::decoder::{DecodedUnit, Geometry};
use crate::utils::error::Result;
use log::trace;

/// Render collaborator for video and subtitle units
pub trait VideoRenderer: Send {
    /// Upload (if not yet uploaded) and present a video unit
    ///
    /// # Arguments
    ///
    /// * `unit` - The unit to show; `unit.uploaded` is set by the caller
    ///   after a successful call, so a redraw of the same unit can skip the
    ///   upload
    ///
    /// # Returns
    ///
    /// Returns an error if presentation failed; the frame is still
    /// considered consumed
    fn upload_and_display(&mut self, unit: &DecodedUnit) -> Result<()>;

    /// Overlay a subtitle on subsequent frames
    fn show_subtitle(&mut self, _unit: &DecodedUnit) {}

    /// Remove the current subtitle overlay
    fn clear_subtitle(&mut self) {}
}

/// Renderer that presents nothing and only remembers what it was given
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    frames: u64,
    uploads: u64,
    last_pts: Option<f64>,
    last_size: Option<(u32, u32)>,
    subtitle: Option<String>,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of display calls
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Number of display calls that needed an upload
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn last_pts(&self) -> Option<f64> {
        self.last_pts
    }

    pub fn last_size(&self) -> Option<(u32, u32)> {
        self.last_size
    }

    pub fn subtitle(&self) -> Option<&str> {
        self.subtitle.as_deref()
    }
}

impl VideoRenderer for HeadlessRenderer {
    fn upload_and_display(&mut self, unit: &DecodedUnit) -> Result<()> {
        if !unit.uploaded {
            self.uploads += 1;
        }
        if let Geometry::Picture { width, height, .. } = unit.geometry {
            self.last_size = Some((width, height));
        }
        self.frames += 1;
        self.last_pts = unit.pts;
        trace!("display frame pts={:?} serial={}", unit.pts, unit.serial);
        Ok(())
    }

    fn show_subtitle(&mut self, unit: &DecodedUnit) {
        if let crate::decoder::FrameData::Text(text) = &unit.data {
            self.subtitle = Some(text.clone());
        }
    }

    fn clear_subtitle(&mut self) {
        self.subtitle = None;
    }
}
