//! Stream header parsing.
//!
//! The first bytes of a source are either a length-prefixed container header
//! or the start of a raw JPEG stream. Producers of container files are not
//! always careful about byte order or value ranges, so each numeric field goes
//! through [`repair_field`]: an out-of-range value is retried byte-swapped and
//! otherwise replaced by a default. Only a stream with no recognizable
//! structure at all is rejected.

use std::{fmt, time::Duration};

use crate::{Error, Result};

/// Bytes needed before a header can be parsed.
pub const MIN_HEADER_LEN: usize = 20;

/// Size of the container header: signature plus four `u32` fields.
pub const CONTAINER_HEADER_LEN: usize = 20;

/// `"MJPG"` read as a little-endian `u32`.
pub const SIGNATURE: u32 = 0x4750_4A4D;

/// `"MJPG"` written by a big-endian producer.
pub const SIGNATURE_SWAPPED: u32 = SIGNATURE.swap_bytes();

pub const MAX_DIMENSION: u32 = 4096;
pub const MAX_FPS: u32 = 120;
/// Plausibility ceiling used to detect byte-swapped frame counts.
pub const MAX_FRAME_COUNT: u32 = 0x00FF_FFFF;

pub const DEFAULT_WIDTH: u32 = 320;
pub const DEFAULT_HEIGHT: u32 = 240;
pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_FRAME_COUNT: u32 = 100;

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

pub(crate) fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

/// Byte order of the numeric fields in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Read a `u32` from the first four bytes of `bytes`.
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }

    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

/// Validated stream properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub signature: u32,
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub fps: u32,
}

impl StreamHeader {
    /// Build a container header with the standard signature.
    pub fn new(width: u32, height: u32, frame_count: u32, fps: u32) -> Self {
        Self {
            signature: SIGNATURE,
            width,
            height,
            frame_count,
            fps,
        }
    }

    /// Time between frames at the declared rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }

    /// Serialize as a container header.
    pub fn to_bytes(&self, order: ByteOrder) -> [u8; CONTAINER_HEADER_LEN] {
        let signature = match order {
            ByteOrder::Little => SIGNATURE,
            ByteOrder::Big => SIGNATURE_SWAPPED,
        };

        let mut out = [0u8; CONTAINER_HEADER_LEN];
        out[0..4].copy_from_slice(&signature.to_le_bytes());
        for (i, value) in [self.width, self.height, self.frame_count, self.fps]
            .into_iter()
            .enumerate()
        {
            let at = 4 + i * 4;
            out[at..at + 4].copy_from_slice(&order.write_u32(value));
        }
        out
    }
}

impl Default for StreamHeader {
    fn default() -> Self {
        Self::new(
            DEFAULT_WIDTH,
            DEFAULT_HEIGHT,
            DEFAULT_FRAME_COUNT,
            DEFAULT_FPS,
        )
    }
}

impl fmt::Display for StreamHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}, {} frames, {} FPS",
            self.width, self.height, self.frame_count, self.fps
        )
    }
}

/// How frames are delimited in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Length-prefixed container; frame headers use this byte order.
    Container(ByteOrder),
    /// Concatenated JPEG images delimited by their own markers.
    RawJpeg,
}

/// What happened to a header field during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Repair {
    /// The stored value was valid.
    #[default]
    None,
    /// The stored value was invalid but its byte-swapped form was valid.
    ByteSwapped,
    /// Neither form was valid; the default was substituted.
    Defaulted,
}

/// A parsed field value and how it was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub value: u32,
    pub repair: Repair,
}

impl Field {
    pub fn was_corrected(&self) -> bool {
        self.repair != Repair::None
    }
}

/// Per-field repair record for one header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderRepairs {
    pub width: Repair,
    pub height: Repair,
    pub frame_count: Repair,
    pub fps: Repair,
}

impl HeaderRepairs {
    pub fn any(&self) -> bool {
        [self.width, self.height, self.frame_count, self.fps]
            .iter()
            .any(|r| *r != Repair::None)
    }
}

/// Result of [`parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub header: StreamHeader,
    pub format: StreamFormat,
    /// Offset of the first frame (or frame header) from the start of the stream.
    pub payload_offset: usize,
    pub repairs: HeaderRepairs,
}

/// Validate one field, trying its byte-swapped form before the default.
pub fn repair_field(raw: u32, valid: impl Fn(u32) -> bool, default: u32) -> Field {
    if valid(raw) {
        return Field {
            value: raw,
            repair: Repair::None,
        };
    }

    let swapped = raw.swap_bytes();
    if valid(swapped) {
        Field {
            value: swapped,
            repair: Repair::ByteSwapped,
        }
    } else {
        Field {
            value: default,
            repair: Repair::Defaulted,
        }
    }
}

fn valid_dimension(value: u32) -> bool {
    value > 0 && value <= MAX_DIMENSION
}

fn valid_fps(value: u32) -> bool {
    value > 0 && value <= MAX_FPS
}

fn valid_frame_count(value: u32) -> bool {
    value > 0 && value <= MAX_FRAME_COUNT
}

/// Parse the opening bytes of a stream.
///
/// # Errors
///
/// - [`Error::InsufficientData`] when fewer than [`MIN_HEADER_LEN`] bytes are given
/// - [`Error::UnrecognizedFormat`] when the signature is unknown and no JPEG
///   start-of-image marker appears in the given bytes
pub fn parse(bytes: &[u8]) -> Result<ParsedHeader> {
    if bytes.len() < MIN_HEADER_LEN {
        return Err(Error::InsufficientData {
            needed: MIN_HEADER_LEN,
            available: bytes.len(),
        });
    }

    if bytes.starts_with(&SOI) {
        return Ok(parse_raw(bytes, 0));
    }

    let signature = ByteOrder::Little.read_u32(bytes);
    match signature {
        SIGNATURE => Ok(parse_container(bytes, signature, ByteOrder::Little)),
        SIGNATURE_SWAPPED => Ok(parse_container(bytes, signature, ByteOrder::Big)),
        _ => match find_marker(bytes, &SOI) {
            Some(offset) => {
                log::warn!(
                    "Unknown signature {:#010x}, treating stream as raw JPEG from offset {}",
                    signature,
                    offset
                );
                Ok(parse_raw(bytes, offset))
            }
            None => Err(Error::UnrecognizedFormat(signature)),
        },
    }
}

fn parse_container(bytes: &[u8], signature: u32, order: ByteOrder) -> ParsedHeader {
    let field = |name: &str, index: usize, valid: fn(u32) -> bool, default: u32| {
        let raw = order.read_u32(&bytes[4 + index * 4..]);
        let field = repair_field(raw, valid, default);
        match field.repair {
            Repair::None => {}
            Repair::ByteSwapped => log::warn!(
                "Header {} {} out of range, using byte-swapped value {}",
                name,
                raw,
                field.value
            ),
            Repair::Defaulted => log::warn!(
                "Header {} {} out of range, using default {}",
                name,
                raw,
                field.value
            ),
        }
        field
    };

    let width = field("width", 0, valid_dimension, DEFAULT_WIDTH);
    let height = field("height", 1, valid_dimension, DEFAULT_HEIGHT);
    let frame_count = field("frame count", 2, valid_frame_count, DEFAULT_FRAME_COUNT);
    let fps = field("fps", 3, valid_fps, DEFAULT_FPS);

    ParsedHeader {
        header: StreamHeader {
            signature,
            width: width.value,
            height: height.value,
            frame_count: frame_count.value,
            fps: fps.value,
        },
        format: StreamFormat::Container(order),
        payload_offset: CONTAINER_HEADER_LEN,
        repairs: HeaderRepairs {
            width: width.repair,
            height: height.repair,
            frame_count: frame_count.repair,
            fps: fps.repair,
        },
    }
}

fn parse_raw(bytes: &[u8], offset: usize) -> ParsedHeader {
    let (width, height) = match jpeg_dimensions(&bytes[offset..]) {
        Some((w, h)) => (
            repair_dimension(u32::from(w), DEFAULT_WIDTH),
            repair_dimension(u32::from(h), DEFAULT_HEIGHT),
        ),
        None => {
            log::debug!("No start-of-frame segment in opening bytes, using default dimensions");
            (
                Field {
                    value: DEFAULT_WIDTH,
                    repair: Repair::Defaulted,
                },
                Field {
                    value: DEFAULT_HEIGHT,
                    repair: Repair::Defaulted,
                },
            )
        }
    };

    ParsedHeader {
        header: StreamHeader {
            signature: bytes
                .get(offset..offset + 4)
                .map_or(0, |sig| ByteOrder::Little.read_u32(sig)),
            width: width.value,
            height: height.value,
            frame_count: 1,
            fps: DEFAULT_FPS,
        },
        format: StreamFormat::RawJpeg,
        payload_offset: offset,
        repairs: HeaderRepairs {
            width: width.repair,
            height: height.repair,
            ..HeaderRepairs::default()
        },
    }
}

fn repair_dimension(value: u32, default: u32) -> Field {
    if valid_dimension(value) {
        Field {
            value,
            repair: Repair::None,
        }
    } else {
        Field {
            value: default,
            repair: Repair::Defaulted,
        }
    }
}

fn is_start_of_frame(marker: u8) -> bool {
    (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

/// Width and height from the first start-of-frame segment of a JPEG image.
///
/// Walks marker segments from the start-of-image marker and stops at the
/// first scan; returns `None` if the segment structure is broken or no
/// start-of-frame segment precedes the scan.
pub fn jpeg_dimensions(jpeg: &[u8]) -> Option<(u16, u16)> {
    if !jpeg.starts_with(&SOI) {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= jpeg.len() {
        if jpeg[pos] != 0xFF {
            return None;
        }

        let marker = jpeg[pos + 1];
        match marker {
            // fill byte before a marker
            0xFF => {
                pos += 1;
                continue;
            }
            0x01 | 0xD0..=0xD8 => {
                pos += 2;
                continue;
            }
            0xD9 | 0xDA => return None,
            _ => {}
        }

        let length = usize::from(u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]));
        if length < 2 {
            return None;
        }

        if is_start_of_frame(marker) {
            // FF Cn | length | precision | height | width
            if pos + 9 > jpeg.len() {
                return None;
            }
            let height = u16::from_be_bytes([jpeg[pos + 5], jpeg[pos + 6]]);
            let width = u16::from_be_bytes([jpeg[pos + 7], jpeg[pos + 8]]);
            return Some((width, height));
        }

        pos += 2 + length;
    }

    None
}
