//! Render target capability and an in-memory implementation.

use crate::{Error, Result};

/// A 24-bit color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb888 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb888 {
    pub const BLACK: Rgb888 = Rgb888 { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// A raster the player draws frames into.
///
/// Frames are drawn pixel by pixel and made visible by [`present`](Display::present).
/// Between frames the display keeps showing the last presented image.
pub trait Display {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn clear(&mut self, color: Rgb888);
    fn draw_pixel(&mut self, x: u32, y: u32, color: Rgb888);
    fn present(&mut self);
}

impl<D: Display + ?Sized> Display for &mut D {
    fn width(&self) -> u32 {
        (**self).width()
    }

    fn height(&self) -> u32 {
        (**self).height()
    }

    fn clear(&mut self, color: Rgb888) {
        (**self).clear(color)
    }

    fn draw_pixel(&mut self, x: u32, y: u32, color: Rgb888) {
        (**self).draw_pixel(x, y, color)
    }

    fn present(&mut self) {
        (**self).present()
    }
}

/// A display backed by an RGB888 frame buffer in memory.
#[derive(Debug, Clone)]
pub struct FrameBufferDisplay {
    width: u32,
    height: u32,
    pixels: Vec<Rgb888>,
    presented: u64,
}

impl FrameBufferDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Rgb888::BLACK; width as usize * height as usize],
            presented: 0,
        }
    }

    /// Pixel at `(x, y)`, or `None` outside the display.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb888> {
        (x < self.width && y < self.height)
            .then(|| self.pixels[y as usize * self.width as usize + x as usize])
    }

    pub fn pixels(&self) -> &[Rgb888] {
        &self.pixels
    }

    /// Number of frames presented so far.
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Encode the current contents as an 8-bit RGB PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        use png::{BitDepth, ColorType, Encoder};

        if self.pixels.is_empty() {
            return Err(Error::DisplayUnavailable(
                "cannot encode an empty display".into(),
            ));
        }

        let rgb: Vec<u8> = self.pixels.iter().flat_map(|p| [p.r, p.g, p.b]).collect();

        let mut png_data = Vec::new();
        let mut encoder = Encoder::new(&mut png_data, self.width, self.height);
        encoder.set_color(ColorType::Rgb);
        encoder.set_depth(BitDepth::Eight);

        encoder
            .write_header()
            .and_then(|mut writer| writer.write_image_data(&rgb))
            .map_err(|e| Error::Io(std::io::Error::other(format!("PNG encoding failed: {e}"))))?;

        Ok(png_data)
    }
}

impl Display for FrameBufferDisplay {
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
        if x < self.width && y < self.height {
            self.pixels[y as usize * self.width as usize + x as usize] = color;
        }
    }

    fn present(&mut self) {
        self.presented += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_and_read_back() {
        let mut display = FrameBufferDisplay::new(4, 3);
        display.draw_pixel(3, 2, Rgb888::new(1, 2, 3));
        display.draw_pixel(4, 0, Rgb888::new(9, 9, 9));

        assert_eq!(display.pixel(3, 2), Some(Rgb888::new(1, 2, 3)));
        assert_eq!(display.pixel(4, 0), None);
        assert_eq!(display.pixel(0, 0), Some(Rgb888::BLACK));
    }

    #[test]
    fn test_clear_and_present() {
        let mut display = FrameBufferDisplay::new(2, 2);
        display.clear(Rgb888::new(7, 7, 7));
        display.present();

        assert!(display.pixels().iter().all(|p| *p == Rgb888::new(7, 7, 7)));
        assert_eq!(display.presented(), 1);
    }

    #[test]
    fn test_encode_png_signature() {
        let display = FrameBufferDisplay::new(8, 8);
        let png = display.encode_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_encode_png_empty_display() {
        assert!(FrameBufferDisplay::new(0, 0).encode_png().is_err());
    }
}
