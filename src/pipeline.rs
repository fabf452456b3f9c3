//! "Give me the next frame": locate, decode and draw one frame per call.

use crate::decode::{rgb565_to_rgb888, JpegDecoder, JpegScale, Rgb565Image};
use crate::display::Display;
use crate::header::ParsedHeader;
use crate::locator::{FrameLocator, LocateError, Strategy};
use crate::source::{EndOfStream, Source};
use crate::{buffer::BoundedBuffer, Error, Result};

/// Locate/fill rounds allowed in one call.
pub const MAX_LOCATE_ATTEMPTS: usize = 8;

/// Default ceiling for the decoded pixel buffer, in bytes.
pub const DEFAULT_PIXEL_BUDGET: usize = 512 * 1024;

/// Details of a frame that reached the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Size of the compressed frame.
    pub jpeg_len: usize,
    pub timestamp: Option<u32>,
    pub decoded_width: u32,
    pub decoded_height: u32,
    pub scale: JpegScale,
}

/// Why a call ended without touching the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoFrameReason {
    /// The source is not open yet.
    NotReady,
    /// No complete frame is buffered and the transport has nothing more right now.
    WaitingForData,
    /// The stream ended and looping is off.
    EndOfStream,
    /// The stream ended and the source will reconnect.
    Reconnecting,
    /// A retryable source error; the message is for logs.
    SourceError(String),
}

/// Why a located frame was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    DecodeFailed,
    CorruptFrame,
    FrameTooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Delivered(FrameInfo),
    NoFrame(NoFrameReason),
    Dropped(DropReason),
}

impl FrameOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, FrameOutcome::Delivered(_))
    }
}

/// Choose the decode scale for a video shown on a display.
///
/// Frames more than twice the display size in either dimension are decoded at
/// half size. If the decoded frame would still exceed `pixel_budget` bytes of
/// RGB565, the scale keeps stepping down to at most one eighth.
pub fn select_scale(video: (u32, u32), display: (u32, u32), pixel_budget: usize) -> JpegScale {
    let (vw, vh) = video;
    let (dw, dh) = display;

    let mut scale = if vw > dw.saturating_mul(2) || vh > dh.saturating_mul(2) {
        JpegScale::Half
    } else {
        JpegScale::None
    };

    loop {
        let (w, h) = scale.scaled(vw, vh);
        if w as usize * h as usize * 2 <= pixel_budget {
            return scale;
        }
        match scale.coarser() {
            Some(next) => scale = next,
            None => return scale,
        }
    }
}

enum Step {
    Decoded(FrameInfo),
    DecodeFailed(Error),
    Corrupt(u32),
    TooLarge(usize),
    NeedData,
}

/// Turns buffered stream bytes into presented frames.
#[derive(Debug)]
pub struct FramePipeline<J> {
    decoder: J,
    locator: FrameLocator,
    scale: JpegScale,
    image: Rgb565Image,
    pixel_budget: usize,
    display_size: (u32, u32),
}

impl<J: JpegDecoder> FramePipeline<J> {
    pub fn new(decoder: J, pixel_budget: usize) -> Self {
        Self {
            decoder,
            locator: FrameLocator::new(Strategy::MarkerScan),
            scale: JpegScale::None,
            image: Rgb565Image::default(),
            pixel_budget,
            display_size: (0, 0),
        }
    }

    /// Prepare for a newly opened stream.
    ///
    /// Selects the locator strategy and the decode scale, and sizes the pixel
    /// buffer once so later frames reuse it.
    pub fn configure(&mut self, parsed: &ParsedHeader, display_width: u32, display_height: u32) {
        let video = (parsed.header.width, parsed.header.height);
        self.display_size = (display_width, display_height);
        self.locator = FrameLocator::for_format(parsed.format);
        self.scale = select_scale(video, self.display_size, self.pixel_budget);

        let (w, h) = self.scale.scaled(video.0, video.1);
        self.image.resize(w, h);

        log::debug!(
            "Pipeline configured: {:?}, decode scale 1/{} ({}x{}, {} bytes)",
            self.locator.strategy(),
            self.scale.divisor(),
            w,
            h,
            self.image.byte_len()
        );
    }

    pub fn scale(&self) -> JpegScale {
        self.scale
    }

    pub fn locator(&self) -> &FrameLocator {
        &self.locator
    }

    /// The most recently decoded frame.
    pub fn image(&self) -> &Rgb565Image {
        &self.image
    }

    pub fn decoder(&self) -> &J {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut J {
        &mut self.decoder
    }

    /// Produce at most one frame.
    ///
    /// Retryable source errors become [`FrameOutcome::NoFrame`] and per-frame
    /// errors become [`FrameOutcome::Dropped`]; only fatal errors are returned.
    pub fn produce_next_frame<S, D>(
        &mut self,
        source: &mut S,
        display: &mut D,
        looping: bool,
    ) -> Result<FrameOutcome>
    where
        S: Source,
        D: Display,
    {
        if !source.is_ready() {
            return Ok(FrameOutcome::NoFrame(NoFrameReason::NotReady));
        }

        for _ in 0..MAX_LOCATE_ATTEMPTS {
            let step = match source.with_buffer(|buf| self.locate_and_decode(buf)) {
                Ok(step) => step,
                Err(e) => return contain(e),
            };

            match step {
                Step::Decoded(info) => {
                    self.blit(display);
                    self.adapt_scale();
                    return Ok(FrameOutcome::Delivered(info));
                }
                Step::DecodeFailed(e) => {
                    log::warn!("Dropping frame: {}", e);
                    return Ok(FrameOutcome::Dropped(DropReason::DecodeFailed));
                }
                Step::Corrupt(size) => {
                    log::warn!("Dropping frame with corrupt size {}", size);
                    return Ok(FrameOutcome::Dropped(DropReason::CorruptFrame));
                }
                Step::TooLarge(len) => {
                    log::warn!("Dropping {} byte frame that cannot fit the stream buffer", len);
                    return Ok(FrameOutcome::Dropped(DropReason::FrameTooLarge));
                }
                Step::NeedData => {}
            }

            let status = match source.fill() {
                Ok(status) => status,
                Err(e) => return contain(e),
            };
            if status.added > 0 {
                continue;
            }
            if !status.end_of_stream {
                return Ok(FrameOutcome::NoFrame(NoFrameReason::WaitingForData));
            }

            match source.on_end_of_stream(looping) {
                Ok(EndOfStream::Restarted) => log::debug!("End of stream, restarting"),
                Ok(EndOfStream::Exhausted) => {
                    return Ok(FrameOutcome::NoFrame(NoFrameReason::EndOfStream))
                }
                Ok(EndOfStream::Reconnecting) => {
                    return Ok(FrameOutcome::NoFrame(NoFrameReason::Reconnecting))
                }
                Err(e) => return contain(e),
            }
        }

        Ok(FrameOutcome::NoFrame(NoFrameReason::WaitingForData))
    }

    fn locate_and_decode(&mut self, buf: &mut BoundedBuffer) -> Step {
        match self.locator.next_frame(buf) {
            Ok(frame) => {
                let jpeg = buf.slice(frame.range.clone());
                match self.decoder.decode(jpeg, self.scale, &mut self.image) {
                    Ok(()) => Step::Decoded(FrameInfo {
                        jpeg_len: frame.len(),
                        timestamp: frame.timestamp,
                        decoded_width: self.image.width(),
                        decoded_height: self.image.height(),
                        scale: self.scale,
                    }),
                    Err(e) => Step::DecodeFailed(e),
                }
            }
            Err(LocateError::CorruptFrame { size }) => Step::Corrupt(size),
            Err(e) => {
                log::trace!("{}", e);
                match self.locator.discard_stalled(buf) {
                    Some(len) => Step::TooLarge(len),
                    None => Step::NeedData,
                }
            }
        }
    }

    /// Draw the decoded frame, sampling the nearest source pixel for every
    /// display pixel.
    fn blit<D: Display>(&self, display: &mut D) {
        let (dw, dh) = (display.width(), display.height());
        let (sw, sh) = (self.image.width(), self.image.height());
        if sw == 0 || sh == 0 {
            return;
        }

        for y in 0..dh {
            let sy = (u64::from(y) * u64::from(sh) / u64::from(dh)) as u32;
            for x in 0..dw {
                let sx = (u64::from(x) * u64::from(sw) / u64::from(dw)) as u32;
                display.draw_pixel(x, y, rgb565_to_rgb888(self.image.pixel(sx, sy)));
            }
        }
        display.present();
    }

    /// Step the scale down when frames turn out larger than the header claimed.
    fn adapt_scale(&mut self) {
        if self.image.byte_len() <= self.pixel_budget {
            return;
        }

        let d = self.scale.divisor();
        let video = (self.image.width() * d, self.image.height() * d);
        let scale = select_scale(video, self.display_size, self.pixel_budget);
        if scale != self.scale {
            log::info!(
                "Decoded frames are {}x{}, switching decode scale to 1/{}",
                video.0,
                video.1,
                scale.divisor()
            );
            self.scale = scale;
        }
    }
}

fn contain(err: Error) -> Result<FrameOutcome> {
    if err.is_fatal() {
        return Err(err);
    }
    log::debug!("Source not producing: {}", err);
    Ok(FrameOutcome::NoFrame(NoFrameReason::SourceError(err.to_string())))
}
