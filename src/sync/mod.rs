//! Synchronization module for avsync
//!
//! Clocks, master clock selection and the presentation-side algorithms
//! (video pacing, audio sample correction, external clock adaptation,
//! buffering, seek and pause orchestration).

pub mod clock;
mod coordinator;
mod pacing;

pub use clock::{Clock, ManualTimeSource, SerialSource, SystemTimeSource, TimeSource};
pub use coordinator::{
    BufferReport, BufferStatus, MediaStream, SeekRequest, StreamBufferInfo, SyncCoordinator,
    SyncStats,
};

use crate::utils::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which clock the other streams are synchronized to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Audio clock is master (default)
    #[serde(rename = "audio")]
    AudioMaster,

    /// Video clock is master
    #[serde(rename = "video")]
    VideoMaster,

    /// Free-running external clock is master
    #[serde(rename = "external")]
    ExternalMaster,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::AudioMaster
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMode::AudioMaster => "audio",
            SyncMode::VideoMaster => "video",
            SyncMode::ExternalMaster => "external",
        };
        f.write_str(name)
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(SyncMode::AudioMaster),
            "video" => Ok(SyncMode::VideoMaster),
            "external" | "ext" => Ok(SyncMode::ExternalMaster),
            _ => Err(SyncError::Config(format!("Invalid sync mode '{}'", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!("audio".parse::<SyncMode>().unwrap(), SyncMode::AudioMaster);
        assert_eq!(" Video ".parse::<SyncMode>().unwrap(), SyncMode::VideoMaster);
        assert_eq!("ext".parse::<SyncMode>().unwrap(), SyncMode::ExternalMaster);
        assert!("wall".parse::<SyncMode>().is_err());
        assert_eq!(SyncMode::ExternalMaster.to_string(), "external");
        assert_eq!(SyncMode::default(), SyncMode::AudioMaster);
    }
}
