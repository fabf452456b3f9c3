//! Byte sources that fill a [`BoundedBuffer`] and parse the stream header.
//!
//! [`SourceDriver`] is a closed set of source kinds behind the shared
//! [`Source`] interface. The frame pipeline only talks to that interface.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use crate::buffer::BoundedBuffer;
use crate::header::ParsedHeader;
use crate::Result;

pub mod file;
pub mod http;
pub mod transport;

pub use file::{FileOptions, FileSource};
pub use http::{FillMode, HttpOptions, HttpSource};
pub use transport::{HttpResponse, HttpTimeouts, HttpTransport};
#[cfg(feature = "http")]
pub use transport::UreqTransport;

/// Where the stream comes from, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    File(PathBuf),
    Http(String),
}

impl SourceConfig {
    pub fn kind(&self) -> VideoSource {
        match self {
            SourceConfig::File(_) => VideoSource::File,
            SourceConfig::Http(_) => VideoSource::Http,
        }
    }
}

impl fmt::Display for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceConfig::File(path) => write!(f, "file {}", path.display()),
            SourceConfig::Http(url) => write!(f, "http {url}"),
        }
    }
}

/// Kind of the active source. Fixed once the player is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSource {
    File,
    Http,
}

/// Result of one fill call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillStatus {
    /// Bytes stored or skipped by this call.
    pub added: usize,
    /// The transport has no more data for the current pass.
    pub end_of_stream: bool,
}

/// What a source did when its stream ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfStream {
    /// Playback continues from the first frame.
    Restarted,
    /// Looping is off and the stream is finished.
    Exhausted,
    /// The connection was closed; the next open attempt restarts the stream.
    Reconnecting,
}

/// Shared interface of all source kinds.
pub trait Source {
    fn kind(&self) -> VideoSource;

    /// True once the header has been parsed and the buffer is allocated.
    fn is_ready(&self) -> bool;

    /// Earliest time a new open attempt is allowed, if one is pending.
    fn next_attempt(&self) -> Option<Instant>;

    /// Open the transport, allocate the buffer and parse the header.
    fn open(&mut self, now: Instant) -> Result<ParsedHeader>;

    /// Move more bytes from the transport into the buffer.
    fn fill(&mut self) -> Result<FillStatus>;

    /// Handle exhaustion of the stream according to the loop flag.
    fn on_end_of_stream(&mut self, looping: bool) -> Result<EndOfStream>;

    /// Run `f` with exclusive access to the buffer.
    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut BoundedBuffer) -> R) -> Result<R>;

    /// Release the buffer and close the transport.
    fn close(&mut self);
}

/// The configured source.
#[derive(Debug)]
pub enum SourceDriver {
    File(FileSource),
    Http(HttpSource),
}

macro_rules! delegate {
    ($self:ident, $src:ident => $body:expr) => {
        match $self {
            SourceDriver::File($src) => $body,
            SourceDriver::Http($src) => $body,
        }
    };
}

impl Source for SourceDriver {
    fn kind(&self) -> VideoSource {
        delegate!(self, s => s.kind())
    }

    fn is_ready(&self) -> bool {
        delegate!(self, s => s.is_ready())
    }

    fn next_attempt(&self) -> Option<Instant> {
        delegate!(self, s => s.next_attempt())
    }

    fn open(&mut self, now: Instant) -> Result<ParsedHeader> {
        delegate!(self, s => s.open(now))
    }

    fn fill(&mut self) -> Result<FillStatus> {
        delegate!(self, s => s.fill())
    }

    fn on_end_of_stream(&mut self, looping: bool) -> Result<EndOfStream> {
        delegate!(self, s => s.on_end_of_stream(looping))
    }

    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut BoundedBuffer) -> R) -> Result<R> {
        delegate!(self, s => s.with_buffer(f))
    }

    fn close(&mut self) {
        delegate!(self, s => s.close())
    }
}

impl From<FileSource> for SourceDriver {
    fn from(source: FileSource) -> Self {
        SourceDriver::File(source)
    }
}

impl From<HttpSource> for SourceDriver {
    fn from(source: HttpSource) -> Self {
        SourceDriver::Http(source)
    }
}
