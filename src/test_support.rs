//! Stream fixtures shared by unit tests.

use std::time::Instant;

use crate::buffer::BoundedBuffer;
use crate::decode::{JpegDecoder, JpegScale, Rgb565Image};
use crate::display::{Display, Rgb888};
use crate::header::{self, ByteOrder, ParsedHeader, StreamHeader, MIN_HEADER_LEN};
use crate::locator::FrameHeader;
use crate::source::{EndOfStream, FillStatus, Source, VideoSource};
use crate::{Error, Result};

/// A structurally valid JPEG marker layout of roughly `body_len` bytes.
///
/// It carries SOI, an APP0 segment, a baseline SOF0 with the given
/// dimensions and EOI. The entropy-coded section is filler and does not
/// decode to an image.
pub fn jpeg_stub(width: u16, height: u16, body_len: usize) -> Vec<u8> {
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
    jpeg.extend_from_slice(b"JFIF\0");
    jpeg.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
    jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
    jpeg.extend_from_slice(&height.to_be_bytes());
    jpeg.extend_from_slice(&width.to_be_bytes());
    jpeg.extend_from_slice(&[0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);
    jpeg.extend((0..body_len).map(|i| (i % 200) as u8 + 1));
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    jpeg
}

/// A little-endian container holding `frames`, with a timestamp step of 33 ms.
pub fn container(header: StreamHeader, frames: &[Vec<u8>]) -> Vec<u8> {
    container_with_order(header, frames, ByteOrder::Little)
}

pub fn container_with_order(header: StreamHeader, frames: &[Vec<u8>], order: ByteOrder) -> Vec<u8> {
    let mut out = header.to_bytes(order).to_vec();
    for (i, frame) in frames.iter().enumerate() {
        let frame_header = FrameHeader {
            size: frame.len() as u32,
            timestamp: i as u32 * 33,
        };
        out.extend_from_slice(&frame_header.to_bytes(order));
        out.extend_from_slice(frame);
    }
    out
}

/// An in-memory [`Source`] that hands out `chunk` bytes per fill.
#[derive(Debug)]
pub struct MemorySource {
    stream: Vec<u8>,
    fed: usize,
    chunk: usize,
    buffer: BoundedBuffer,
    payload_offset: usize,
    ready: bool,
    pub opens: usize,
    pub restarts: usize,
}

impl MemorySource {
    pub fn new(stream: Vec<u8>, chunk: usize) -> Self {
        Self::with_capacity(stream, chunk, 4096)
    }

    pub fn with_capacity(stream: Vec<u8>, chunk: usize, capacity: usize) -> Self {
        Self {
            stream,
            fed: 0,
            chunk,
            buffer: BoundedBuffer::new(capacity),
            payload_offset: 0,
            ready: false,
            opens: 0,
            restarts: 0,
        }
    }

    pub fn open_now(&mut self) -> Result<ParsedHeader> {
        self.open(Instant::now())
    }

    fn feed(&mut self) -> usize {
        let end = (self.fed + self.chunk).min(self.stream.len());
        let n = self.buffer.append(&self.stream[self.fed..end]);
        self.fed += n;
        n
    }
}

impl Source for MemorySource {
    fn kind(&self) -> VideoSource {
        VideoSource::File
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn next_attempt(&self) -> Option<Instant> {
        None
    }

    fn open(&mut self, _now: Instant) -> Result<ParsedHeader> {
        self.opens += 1;
        self.buffer.clear();
        self.fed = 0;
        while self.buffer.used() < MIN_HEADER_LEN && self.fed < self.stream.len() {
            self.feed();
        }

        let parsed = header::parse(self.buffer.filled())?;
        self.payload_offset = parsed.payload_offset;
        self.buffer.mark_payload_start(parsed.payload_offset);
        self.ready = true;
        Ok(parsed)
    }

    fn fill(&mut self) -> Result<FillStatus> {
        if !self.ready {
            return Err(Error::NotReady("memory source is not open"));
        }
        if self.buffer.free() < self.chunk {
            self.buffer.compact();
        }
        let added = self.feed();
        Ok(FillStatus {
            added,
            end_of_stream: self.fed == self.stream.len(),
        })
    }

    fn on_end_of_stream(&mut self, looping: bool) -> Result<EndOfStream> {
        if !looping {
            return Ok(EndOfStream::Exhausted);
        }
        self.restarts += 1;
        if !self.buffer.rewind() {
            self.buffer.clear();
            self.fed = self.payload_offset;
        }
        Ok(EndOfStream::Restarted)
    }

    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut BoundedBuffer) -> R) -> Result<R> {
        Ok(f(&mut self.buffer))
    }

    fn close(&mut self) {
        self.ready = false;
    }
}

/// Produces a coordinate pattern at the dimensions found in the frame's
/// start-of-frame segment. Frames without one fail to decode.
#[derive(Debug, Default)]
pub struct StubDecoder {
    pub decoded: usize,
    pub scales: Vec<JpegScale>,
}

impl StubDecoder {
    pub fn pattern(x: u32, y: u32) -> u16 {
        (((x % 32) as u16) << 11) | (((y % 64) as u16) << 5)
    }
}

impl JpegDecoder for StubDecoder {
    fn decode(&mut self, jpeg: &[u8], scale: JpegScale, out: &mut Rgb565Image) -> Result<()> {
        let (w, h) = header::jpeg_dimensions(jpeg)
            .ok_or_else(|| Error::Decode("no start-of-frame segment".into()))?;
        let (w, h) = scale.scaled(u32::from(w), u32::from(h));
        out.resize(w, h);
        let pixels = out.pixels_mut();
        for y in 0..h {
            for x in 0..w {
                pixels[(y * w + x) as usize] = Self::pattern(x, y);
            }
        }
        self.decoded += 1;
        self.scales.push(scale);
        Ok(())
    }
}

/// Records how often each pixel is drawn.
#[derive(Debug)]
pub struct CountingDisplay {
    width: u32,
    height: u32,
    pixels: Vec<Rgb888>,
    pub draws: Vec<u32>,
    pub presented: u32,
}

impl CountingDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            pixels: vec![Rgb888::BLACK; len],
            draws: vec![0; len],
            presented: 0,
        }
    }

    pub fn color(&self, x: u32, y: u32) -> Rgb888 {
        self.pixels[(y * self.width + x) as usize]
    }

    pub fn each_pixel_drawn(&self, times: u32) -> bool {
        self.draws.iter().all(|count| *count == times)
    }
}

impl Display for CountingDisplay {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn clear(&mut self, color: Rgb888) {
        self.pixels.fill(color);
    }

    fn draw_pixel(&mut self, x: u32, y: u32, color: Rgb888) {
        let at = (y * self.width + x) as usize;
        self.pixels[at] = color;
        self.draws[at] += 1;
    }

    fn present(&mut self) {
        self.presented += 1;
    }
}
