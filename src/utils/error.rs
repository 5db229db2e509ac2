//! Error types for avsync
//!
//! Failures are scoped to the stream that produced them. Cooperative
//! shutdown (`QueueAborted`) is modelled as an error so it can flow through
//! `?`, but callers treat it as a normal exit path rather than a failure.
//! Codec backpressure and stale-epoch data never reach this type; they are
//! resolved inside the decode loop.

use crate::decoder::StreamKind;
use thiserror::Error;

/// Main error type for avsync
#[derive(Error, Debug)]
pub enum SyncError {
    /// The owning queue was aborted (shutdown, stream close)
    #[error("Queue aborted")]
    QueueAborted,

    /// The codec reported an unrecoverable error; only its stream is closed
    #[error("Codec error on {stream} stream: {message}")]
    CodecFatal {
        stream: StreamKind,
        message: String,
    },

    /// Buffer allocation failed inside a decode worker
    #[error("Allocation failure on {stream} stream: {message}")]
    Allocation {
        stream: StreamKind,
        message: String,
    },

    /// Operation requires a stream that is not open
    #[error("Stream not open: {0}")]
    StreamNotOpen(StreamKind),

    /// Attempt to open a stream kind twice
    #[error("Stream already open: {0}")]
    StreamAlreadyOpen(StreamKind),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File I/O errors
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether this error is the cooperative shutdown signal
    pub fn is_aborted(&self) -> bool {
        matches!(self, SyncError::QueueAborted)
    }
}

/// Convenience type alias for Results in avsync
pub type Result<T> = std::result::Result<T, SyncError>;

/// Extension trait for converting other errors to SyncError
pub trait IntoSyncError<T> {
    /// Convert this error into a SyncError with the given context
    fn config_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoSyncError<T> for std::result::Result<T, E> {
    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| SyncError::Config(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::SyncError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::SyncError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}
