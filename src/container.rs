//! Writer for the length-prefixed MJPEG container.

use std::io::Write;

use crate::header::{ByteOrder, StreamHeader};
use crate::locator::{FrameHeader, MAX_FRAME_SIZE};
use crate::{Error, Result};

/// Writes a container header followed by length-prefixed JPEG frames.
///
/// The declared frame count is written up front and is not patched when the
/// writer finishes; readers treat it as informational.
///
/// # Examples
///
/// ```
/// use mjpeg_stream::{container::MjpegWriter, StreamHeader};
///
/// let mut writer = MjpegWriter::new(Vec::new(), &StreamHeader::new(320, 240, 1, 30))?;
/// writer.push_frame(&[0xFF, 0xD8, 0xFF, 0xD9], 0)?;
/// let bytes = writer.finish()?;
/// assert_eq!(bytes.len(), 20 + 8 + 4);
/// # Ok::<(), mjpeg_stream::Error>(())
/// ```
#[derive(Debug)]
pub struct MjpegWriter<W: Write> {
    inner: W,
    order: ByteOrder,
    frames_written: u32,
}

impl<W: Write> MjpegWriter<W> {
    /// Write a little-endian header and return the writer.
    pub fn new(inner: W, header: &StreamHeader) -> Result<Self> {
        Self::with_byte_order(inner, header, ByteOrder::Little)
    }

    pub fn with_byte_order(mut inner: W, header: &StreamHeader, order: ByteOrder) -> Result<Self> {
        inner.write_all(&header.to_bytes(order))?;
        Ok(Self {
            inner,
            order,
            frames_written: 0,
        })
    }

    /// Append one JPEG frame with its presentation timestamp in milliseconds.
    pub fn push_frame(&mut self, jpeg: &[u8], timestamp_ms: u32) -> Result<()> {
        let size = u32::try_from(jpeg.len())
            .ok()
            .filter(|size| *size > 0 && *size <= MAX_FRAME_SIZE)
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "frame of {} bytes is outside 1..={} bytes",
                    jpeg.len(),
                    MAX_FRAME_SIZE
                ))
            })?;

        let header = FrameHeader {
            size,
            timestamp: timestamp_ms,
        };
        self.inner.write_all(&header.to_bytes(self.order))?;
        self.inner.write_all(jpeg)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u32 {
        self.frames_written
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{self, StreamFormat};
    use crate::test_support::jpeg_stub;

    #[test]
    fn test_writer_output_parses_back() {
        let mut writer = MjpegWriter::new(Vec::new(), &StreamHeader::new(160, 120, 2, 10)).unwrap();
        writer.push_frame(&jpeg_stub(160, 120, 12), 0).unwrap();
        writer.push_frame(&jpeg_stub(160, 120, 12), 100).unwrap();
        assert_eq!(writer.frames_written(), 2);
        let bytes = writer.finish().unwrap();

        let parsed = header::parse(&bytes).unwrap();
        assert_eq!(parsed.header, StreamHeader::new(160, 120, 2, 10));
        assert_eq!(parsed.format, StreamFormat::Container(ByteOrder::Little));
        assert!(!parsed.repairs.any());
    }

    #[test]
    fn test_big_endian_writer() {
        let writer = MjpegWriter::with_byte_order(
            Vec::new(),
            &StreamHeader::new(64, 64, 1, 5),
            ByteOrder::Big,
        )
        .unwrap();
        let bytes = writer.finish().unwrap();

        let parsed = header::parse(&bytes).unwrap();
        assert_eq!(parsed.format, StreamFormat::Container(ByteOrder::Big));
        assert_eq!(parsed.header.width, 64);
    }

    #[test]
    fn test_rejects_empty_frame() {
        let mut writer = MjpegWriter::new(Vec::new(), &StreamHeader::default()).unwrap();
        assert!(matches!(
            writer.push_frame(&[], 0),
            Err(Error::InvalidConfiguration(_))
        ));
        assert_eq!(writer.frames_written(), 0);
    }
}
