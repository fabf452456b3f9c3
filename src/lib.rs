//! Bounded-memory MJPEG playback from files and HTTP streams.
//!
//! This crate turns a byte stream of JPEG frames into frames drawn on a
//! display, under a fixed memory budget. It reads two stream layouts:
//!
//! - a **container**: a 20-byte stream header followed by frames, each
//!   prefixed by an 8-byte size/timestamp header
//! - **raw JPEG**: concatenated JPEG images, as served by MJPEG cameras
//!
//! # Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "image-decoding")]
//! # fn main() -> Result<(), mjpeg_stream::Error> {
//! use mjpeg_stream::{FrameBufferDisplay, ImageDecoder, Player, PlayerOptions, TickOutcome};
//!
//! let options = PlayerOptions::builder()
//!     .http("http://camera.local/stream.mjpeg")
//!     .build()?;
//! let mut player = Player::new(options, FrameBufferDisplay::new(320, 240), ImageDecoder::new())?;
//!
//! loop {
//!     if player.tick() == TickOutcome::Failed {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "image-decoding"))]
//! # fn main() {}
//! ```
//!
//! # Core Concepts
//!
//! ## Player
//!
//! [`Player`] is driven by the caller's timer. Each [`tick`](Player::tick)
//! opens the source when needed and, once the frame interval has elapsed,
//! produces at most one frame. Retryable failures back off and try again on a
//! later tick; only fatal errors stop playback.
//!
//! ## Sources
//!
//! A [`FileSource`] or [`HttpSource`] fills a [`BoundedBuffer`] allocated from
//! a [`PoolSet`]. HTTP connections go through an [`HttpTransport`]; the
//! `http` feature provides one backed by `ureq`.
//!
//! ## Frames
//!
//! The [`FrameLocator`] finds the next complete frame in the buffer, the
//! [`JpegDecoder`] decodes it to RGB565 at a [`JpegScale`] chosen from the
//! display size, and the frame is scaled onto the [`Display`].
//!
//! ## Writing containers
//!
//! [`container::MjpegWriter`] writes the container layout from JPEG frames.
//!
//! # Features
//!
//! - `http` (default): `ureq` HTTP transport
//! - `image-decoding`: `image`-backed [`JpegDecoder`]
//! - `tokio`, `async-std`: async wrappers that tick on a blocking pool

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// Internal modules
mod error;

// Public modules
pub mod buffer;
pub mod container;
pub mod decode;
pub mod display;
pub mod header;
pub mod locator;
pub mod pipeline;
pub mod player;
pub mod source;

#[cfg(any(feature = "tokio", feature = "async-std"))]
mod async_runtime;

#[cfg(feature = "async-std")]
pub use async_runtime::async_std;
#[cfg(feature = "tokio")]
pub use async_runtime::tokio;

// Re-exports
pub use {
    buffer::{BoundedBuffer, MemoryPool, PoolSet, SharedBuffer},
    decode::{JpegDecoder, JpegScale, Rgb565Image},
    display::{Display, FrameBufferDisplay, Rgb888},
    error::*,
    header::{ByteOrder, ParsedHeader, StreamFormat, StreamHeader},
    locator::{FrameLocator, LocateError, LocatedFrame},
    pipeline::{DropReason, FrameInfo, FrameOutcome, FramePipeline, NoFrameReason},
    player::{
        PlaybackState, Player, PlayerOptions, PlayerOptionsBuilder, PlayerStats, PlayerStatus,
        TickOutcome,
    },
    source::{
        FileSource, FillMode, HttpSource, HttpTimeouts, HttpTransport, Source, SourceConfig,
        SourceDriver, VideoSource,
    },
};

#[cfg(feature = "image-decoding")]
pub use decode::ImageDecoder;

/// Alias for Result with our Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test_support;

// Tests
#[cfg(test)]
#[path = "tests.rs"]
mod tests;
