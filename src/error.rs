//! Error types for the mjpeg-stream library.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::locator::LocateError;

/// How far an error is allowed to travel.
///
/// Playback never stops on its own: only fatal errors mark the owning
/// component unusable. Retryable errors are contained within the source
/// driver, per-frame errors within the frame pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The component is unusable until it is reconfigured or recreated.
    Fatal,
    /// The current attempt failed; a later tick tries again.
    Retryable,
    /// One frame is skipped; the stream continues.
    PerFrame,
}

/// The main error type for MJPEG stream operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The render target is missing or has no drawable area.
    #[error("Display unavailable: {0}")]
    DisplayUnavailable(String),

    /// A file-backed source could not be opened.
    #[error("Failed to open video source {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Not enough bytes are buffered to read a stream header.
    #[error("Insufficient data: needed {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },

    /// The stream is neither a recognized container nor a JPEG stream.
    ///
    /// There is no recoverable structure in the opening bytes.
    #[error("Unrecognized stream format (signature {0:#010x}, no JPEG start-of-image marker)")]
    UnrecognizedFormat(u32),

    /// The network interface or remote host is not reachable yet.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The HTTP server answered with something other than 200.
    #[error("HTTP request returned status {0}")]
    HttpStatus(u16),

    /// A connection, read or fill operation exceeded its time budget.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The source has no open stream or buffer yet.
    #[error("Source not ready: {0}")]
    NotReady(&'static str),

    /// The shared stream buffer stayed locked longer than the bounded wait.
    #[error("Buffer lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// No memory pool could provide a buffer of the minimum viable size.
    #[error("Failed to allocate a stream buffer of at least {minimum} bytes (wanted {requested})")]
    AllocationFailed { requested: usize, minimum: usize },

    /// A frame could not be located in the buffered bytes.
    #[error(transparent)]
    Frame(#[from] LocateError),

    /// The JPEG decoder rejected a frame.
    #[error("JPEG decode failed: {0}")]
    Decode(String),

    /// Configuration parameters are invalid.
    ///
    /// This can occur when builder validation fails or conflicting options are set.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A blocking task running a tick did not complete.
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    /// I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify this error for propagation.
    pub fn severity(&self) -> Severity {
        match self {
            Error::DisplayUnavailable(_)
            | Error::SourceUnavailable { .. }
            | Error::UnrecognizedFormat(_)
            | Error::InvalidConfiguration(_) => Severity::Fatal,
            Error::Frame(_) | Error::Decode(_) => Severity::PerFrame,
            Error::InsufficientData { .. }
            | Error::NetworkUnavailable(_)
            | Error::HttpStatus(_)
            | Error::Timeout(_)
            | Error::LockTimeout(_)
            | Error::NotReady(_)
            | Error::AllocationFailed { .. }
            | Error::TaskFailed(_)
            | Error::Io(_) => Severity::Retryable,
        }
    }

    /// Shorthand for `severity() == Severity::Fatal`.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
