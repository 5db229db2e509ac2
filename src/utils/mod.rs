//! Utility module for avsync
//!
//! - Error handling with custom error types
//! - Configuration management
//! - Time formatting for log output

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{AudioConfig, BufferConfig, Config, DecoderConfig, GeneralConfig, SyncConfig};
pub use error::{IntoSyncError, Result, SyncError};

/// Load configuration from the layered sources, see [`Config::load`]
pub fn load_config(explicit: Option<&std::path::Path>) -> Result<Config> {
    Config::load(explicit)
}

/// Format seconds for display as "HH:MM:SS.mmm" or "MM:SS.mmm"
///
/// Invalid (absent) times render as "--:--".
pub fn format_seconds(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| s.is_finite()) else {
        return "--:--".to_string();
    };

    let sign = if seconds < 0.0 { "-" } else { "" };
    let total_ms = (seconds.abs() * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    if hours > 0 {
        format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, secs, millis)
    } else {
        format!("{}{:02}:{:02}.{:03}", sign, minutes, secs, millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(None), "--:--");
        assert_eq!(format_seconds(Some(f64::NAN)), "--:--");
        assert_eq!(format_seconds(Some(0.0)), "00:00.000");
        assert_eq!(format_seconds(Some(1.04)), "00:01.040");
        assert_eq!(format_seconds(Some(3599.5)), "59:59.500");
        assert_eq!(format_seconds(Some(3600.0)), "01:00:00.000");
        assert_eq!(format_seconds(Some(-2.5)), "-00:02.500");
    }
}
