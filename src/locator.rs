//! Frame boundary detection over a [`BoundedBuffer`].
//!
//! Two strategies exist. Container streams carry an 8-byte frame header with
//! the payload size, so a frame is complete once `8 + size` bytes are
//! buffered. Raw streams are scanned for the JPEG start and end markers.

use std::ops::Range;

use thiserror::Error;

use crate::buffer::BoundedBuffer;
use crate::header::{find_marker, ByteOrder, StreamFormat, EOI, SOI};

/// Size of the per-frame header in container streams.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload size accepted from a frame header.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Header preceding each frame in a container stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: u32,
    /// Presentation time in milliseconds. Informational only.
    pub timestamp: u32,
}

impl FrameHeader {
    /// Read a frame header from the first [`FRAME_HEADER_LEN`] bytes.
    pub fn parse(bytes: &[u8], order: ByteOrder) -> Self {
        Self {
            size: order.read_u32(&bytes[0..4]),
            timestamp: order.read_u32(&bytes[4..8]),
        }
    }

    pub fn to_bytes(&self, order: ByteOrder) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..4].copy_from_slice(&order.write_u32(self.size));
        out[4..8].copy_from_slice(&order.write_u32(self.timestamp));
        out
    }

    pub fn is_valid(&self) -> bool {
        self.size > 0 && self.size <= MAX_FRAME_SIZE
    }
}

/// Why no frame was returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// A frame header or payload is only partially buffered.
    #[error("Insufficient buffered data: needed {needed} bytes, {available} available")]
    InsufficientBufferedData { needed: usize, available: usize },

    /// No start-of-image marker in the unread bytes.
    #[error("No JPEG start-of-image marker in buffered data")]
    NoFrameFound,

    /// A start-of-image marker was found but its end marker is not buffered yet.
    #[error("JPEG end-of-image marker not buffered yet")]
    IncompleteFrame,

    /// The frame header declared an impossible size.
    #[error("Corrupt frame header (declared size {size})")]
    CorruptFrame { size: u32 },
}

impl LocateError {
    /// True if buffering more bytes may produce a frame.
    pub fn needs_more_data(&self) -> bool {
        !matches!(self, LocateError::CorruptFrame { .. })
    }
}

/// A complete JPEG frame inside the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedFrame {
    /// Absolute range of the JPEG bytes in [`BoundedBuffer::filled`].
    pub range: Range<usize>,
    /// Frame header timestamp; `None` for raw streams.
    pub timestamp: Option<u32>,
}

impl LocatedFrame {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LengthPrefixed(ByteOrder),
    MarkerScan,
}

/// Finds the next complete frame and advances the buffer's read cursor past it.
#[derive(Debug, Clone, Copy)]
pub struct FrameLocator {
    strategy: Strategy,
}

impl FrameLocator {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    pub fn for_format(format: StreamFormat) -> Self {
        match format {
            StreamFormat::Container(order) => Self::new(Strategy::LengthPrefixed(order)),
            StreamFormat::RawJpeg => Self::new(Strategy::MarkerScan),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Locate the next frame starting at the read cursor.
    ///
    /// On success the cursor moves past the frame. On failure the cursor is
    /// left where the next attempt should resume.
    pub fn next_frame(&self, buf: &mut BoundedBuffer) -> Result<LocatedFrame, LocateError> {
        match self.strategy {
            Strategy::LengthPrefixed(order) => next_prefixed(buf, order),
            Strategy::MarkerScan => next_marked(buf),
        }
    }

    /// Drop a frame that can never fit in `buf`.
    ///
    /// Returns the number of bytes discarded, including bytes that have not
    /// been received yet, or `None` if the frame at the cursor is not
    /// oversized.
    pub fn discard_stalled(&self, buf: &mut BoundedBuffer) -> Option<usize> {
        match self.strategy {
            Strategy::LengthPrefixed(order) => {
                let unread = buf.unread();
                if unread.len() < FRAME_HEADER_LEN {
                    return None;
                }
                let header = FrameHeader::parse(unread, order);
                let total = FRAME_HEADER_LEN + header.size as usize;
                if !header.is_valid() || total <= buf.capacity() {
                    return None;
                }
                buf.skip(total);
                Some(total)
            }
            Strategy::MarkerScan => {
                if !buf.is_stalled() {
                    return None;
                }
                let n = buf.unread_len();
                buf.skip(n);
                Some(n)
            }
        }
    }
}

fn next_prefixed(buf: &mut BoundedBuffer, order: ByteOrder) -> Result<LocatedFrame, LocateError> {
    let cursor = buf.read_cursor();
    let unread = buf.unread();

    if unread.len() < FRAME_HEADER_LEN {
        return Err(LocateError::InsufficientBufferedData {
            needed: FRAME_HEADER_LEN,
            available: unread.len(),
        });
    }

    let header = FrameHeader::parse(unread, order);
    if !header.is_valid() {
        // A real frame header sits 8 bytes before its JPEG start marker.
        // Search past the rejected header so the cursor always advances.
        let tail = unread.get(FRAME_HEADER_LEN + 1..).unwrap_or_default();
        let resume = match find_marker(tail, &SOI) {
            Some(pos) => cursor + 1 + pos,
            None => (cursor + 1).max(buf.used().saturating_sub(FRAME_HEADER_LEN + 1)),
        };
        log::debug!(
            "Corrupt frame header at {} (size {}), resuming at {}",
            cursor,
            header.size,
            resume
        );
        buf.set_read_cursor(resume);
        return Err(LocateError::CorruptFrame { size: header.size });
    }

    let needed = FRAME_HEADER_LEN + header.size as usize;
    if unread.len() < needed {
        return Err(LocateError::InsufficientBufferedData {
            needed,
            available: unread.len(),
        });
    }

    let start = cursor + FRAME_HEADER_LEN;
    let end = cursor + needed;
    buf.set_read_cursor(end);

    Ok(LocatedFrame {
        range: start..end,
        timestamp: Some(header.timestamp),
    })
}

fn next_marked(buf: &mut BoundedBuffer) -> Result<LocatedFrame, LocateError> {
    let cursor = buf.read_cursor();
    let unread = buf.unread();

    let Some(soi_pos) = find_marker(unread, &SOI) else {
        // Keep the last byte; it may be the first half of a split marker.
        if unread.len() > 1 {
            buf.set_read_cursor(buf.used() - 1);
        }
        return Err(LocateError::NoFrameFound);
    };

    let soi = cursor + soi_pos;
    match find_marker(&unread[soi_pos + 2..], &EOI) {
        Some(eoi_pos) => {
            let end = soi + 2 + eoi_pos + 2;
            buf.set_read_cursor(end);
            Ok(LocatedFrame {
                range: soi..end,
                timestamp: None,
            })
        }
        None => {
            buf.set_read_cursor(soi);
            Err(LocateError::IncompleteFrame)
        }
    }
}
