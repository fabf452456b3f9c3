//! JPEG decode capability and the RGB565 pixel buffer it fills.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::display::Rgb888;
use crate::Result;

/// Power-of-two downscale applied while decoding.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum JpegScale {
    /// Full resolution.
    #[default]
    None = 0,
    /// Half width and height.
    Half = 1,
    Quarter = 2,
    Eighth = 3,
}

impl JpegScale {
    pub fn divisor(self) -> u32 {
        1 << u8::from(self)
    }

    /// Output dimensions for a source of `width` x `height`, rounded up.
    pub fn scaled(self, width: u32, height: u32) -> (u32, u32) {
        let d = self.divisor();
        (width.div_ceil(d), height.div_ceil(d))
    }

    /// The next stronger downscale, if any.
    pub fn coarser(self) -> Option<Self> {
        JpegScale::try_from(u8::from(self) + 1).ok()
    }
}

/// A decoded frame in RGB565, row-major.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rgb565Image {
    width: u32,
    height: u32,
    pixels: Vec<u16>,
}

impl Rgb565Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    /// Change the dimensions, reusing the existing allocation when it is large enough.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width as usize * height as usize, 0);
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    /// Pixel at `(x, y)`. Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Bytes held by the pixel data.
    pub fn byte_len(&self) -> usize {
        self.pixels.len() * 2
    }

    /// Allocated capacity in pixels.
    pub fn capacity(&self) -> usize {
        self.pixels.capacity()
    }
}

/// Decodes one JPEG image into an RGB565 buffer.
///
/// On success `out` has the source dimensions divided by `scale` (rounded up).
/// Implementations should resize `out` rather than replace it so the
/// allocation is reused from frame to frame.
pub trait JpegDecoder {
    fn decode(&mut self, jpeg: &[u8], scale: JpegScale, out: &mut Rgb565Image) -> Result<()>;
}

impl<D: JpegDecoder + ?Sized> JpegDecoder for Box<D> {
    fn decode(&mut self, jpeg: &[u8], scale: JpegScale, out: &mut Rgb565Image) -> Result<()> {
        (**self).decode(jpeg, scale, out)
    }
}

pub fn rgb888_to_rgb565(rgb: Rgb888) -> u16 {
    (u16::from(rgb.r >> 3) << 11) | (u16::from(rgb.g >> 2) << 5) | u16::from(rgb.b >> 3)
}

/// Expand RGB565 to RGB888, replicating high bits into the low ones.
pub fn rgb565_to_rgb888(pixel: u16) -> Rgb888 {
    let r = ((pixel >> 11) & 0x1F) as u8;
    let g = ((pixel >> 5) & 0x3F) as u8;
    let b = (pixel & 0x1F) as u8;
    Rgb888 {
        r: (r << 3) | (r >> 2),
        g: (g << 2) | (g >> 4),
        b: (b << 3) | (b >> 2),
    }
}

#[cfg(feature = "image-decoding")]
pub use self::image_decoder::ImageDecoder;

#[cfg(feature = "image-decoding")]
mod image_decoder {
    use std::io::Cursor;

    use image::{ImageFormat, ImageReader, Limits};

    use super::{rgb888_to_rgb565, JpegDecoder, JpegScale, Rgb565Image};
    use crate::display::Rgb888;
    use crate::{Error, Result};

    /// [`JpegDecoder`] backed by the `image` crate.
    ///
    /// The image is decoded at full resolution and then point-sampled down to
    /// the requested scale. Peak memory is therefore a full-size RGB8 image
    /// (`width * height * 3` bytes of the JPEG itself), whatever pixel budget
    /// the pipeline chose. Use [`ImageDecoder::with_max_decode_bytes`] to turn
    /// larger frames into decode failures instead.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ImageDecoder {
        max_decode_bytes: Option<u64>,
    }

    impl ImageDecoder {
        pub fn new() -> Self {
            Self::default()
        }

        /// Refuse frames whose decode would allocate more than `bytes`.
        pub fn with_max_decode_bytes(bytes: u64) -> Self {
            Self {
                max_decode_bytes: Some(bytes),
            }
        }
    }

    impl JpegDecoder for ImageDecoder {
        fn decode(&mut self, jpeg: &[u8], scale: JpegScale, out: &mut Rgb565Image) -> Result<()> {
            let mut reader = ImageReader::with_format(Cursor::new(jpeg), ImageFormat::Jpeg);
            let mut limits = Limits::default();
            limits.max_alloc = self.max_decode_bytes.or(limits.max_alloc);
            reader.limits(limits);
            let rgb = reader
                .decode()
                .map_err(|e| Error::Decode(e.to_string()))?
                .into_rgb8();

            let (src_w, src_h) = rgb.dimensions();
            let (dst_w, dst_h) = scale.scaled(src_w, src_h);
            out.resize(dst_w, dst_h);

            let d = scale.divisor();
            let pixels = out.pixels_mut();
            for y in 0..dst_h {
                let sy = (y * d).min(src_h - 1);
                for x in 0..dst_w {
                    let sx = (x * d).min(src_w - 1);
                    let [r, g, b] = rgb.get_pixel(sx, sy).0;
                    pixels[(y * dst_w + x) as usize] = rgb888_to_rgb565(Rgb888 { r, g, b });
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_from_primitive() {
        assert_eq!(JpegScale::try_from(2u8).unwrap(), JpegScale::Quarter);
        assert!(JpegScale::try_from(4u8).is_err());
        assert_eq!(u8::from(JpegScale::Eighth), 3);
    }

    #[test]
    fn test_scaled_dimensions_round_up() {
        assert_eq!(JpegScale::None.scaled(641, 481), (641, 481));
        assert_eq!(JpegScale::Half.scaled(641, 481), (321, 241));
        assert_eq!(JpegScale::Eighth.scaled(100, 60), (13, 8));
    }

    #[test]
    fn test_coarser_stops_at_eighth() {
        assert_eq!(JpegScale::None.coarser(), Some(JpegScale::Half));
        assert_eq!(JpegScale::Quarter.coarser(), Some(JpegScale::Eighth));
        assert_eq!(JpegScale::Eighth.coarser(), None);
    }

    #[test]
    fn test_rgb565_conversion_extremes() {
        assert_eq!(rgb565_to_rgb888(0xFFFF), Rgb888 { r: 255, g: 255, b: 255 });
        assert_eq!(rgb565_to_rgb888(0x0000), Rgb888 { r: 0, g: 0, b: 0 });
        assert_eq!(rgb565_to_rgb888(0xF800), Rgb888 { r: 255, g: 0, b: 0 });
        assert_eq!(rgb888_to_rgb565(Rgb888 { r: 0, g: 255, b: 0 }), 0x07E0);
    }

    #[test]
    fn test_resize_reuses_allocation() {
        let mut image = Rgb565Image::new(64, 64);
        let capacity = image.capacity();

        image.resize(32, 16);
        assert_eq!(image.pixels().len(), 512);
        assert_eq!(image.capacity(), capacity);
        assert_eq!(image.byte_len(), 1024);
    }

    #[cfg(feature = "image-decoding")]
    mod image_decoding {
        use super::super::*;
        use jpeg_encoder::{ColorType, Encoder};

        fn solid_jpeg(width: u16, height: u16, rgb: [u8; 3]) -> Vec<u8> {
            let data: Vec<u8> = (0..usize::from(width) * usize::from(height))
                .flat_map(|_| rgb)
                .collect();
            let mut out = Vec::new();
            Encoder::new(&mut out, 95)
                .encode(&data, width, height, ColorType::Rgb)
                .unwrap();
            out
        }

        #[test]
        fn test_decodes_at_requested_scale() {
            let jpeg = solid_jpeg(64, 48, [250, 10, 10]);
            let mut out = Rgb565Image::default();

            ImageDecoder::new()
                .decode(&jpeg, JpegScale::Half, &mut out)
                .unwrap();

            assert_eq!((out.width(), out.height()), (32, 24));
            let centre = rgb565_to_rgb888(out.pixel(16, 12));
            assert!(centre.r > 200 && centre.g < 60 && centre.b < 60, "{centre:?}");
        }

        #[test]
        fn test_garbage_is_decode_error() {
            let mut out = Rgb565Image::default();
            let err = ImageDecoder::new()
                .decode(&[0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9], JpegScale::None, &mut out)
                .unwrap_err();
            assert!(matches!(err, crate::Error::Decode(_)));
        }
    }

    #[cfg(feature = "image-decoding")]
    mod image_decoding {
        use crate::decode::{ImageDecoder, JpegDecoder, JpegScale, Rgb565Image};
        use crate::Error;

        fn encode(width: u16, height: u16) -> Vec<u8> {
            let data = vec![200u8; usize::from(width) * usize::from(height) * 3];
            let mut out = Vec::new();
            jpeg_encoder::Encoder::new(&mut out, 90)
                .encode(&data, width, height, jpeg_encoder::ColorType::Rgb)
                .unwrap();
            out
        }

        #[test]
        fn test_decodes_at_requested_scale() {
            let mut out = Rgb565Image::default();
            ImageDecoder::new()
                .decode(&encode(64, 48), JpegScale::Half, &mut out)
                .unwrap();
            assert_eq!((out.width(), out.height()), (32, 24));
        }

        #[test]
        fn test_decode_over_allocation_cap_fails() {
            let jpeg = encode(64, 48);
            let mut out = Rgb565Image::default();

            let err = ImageDecoder::with_max_decode_bytes(1024)
                .decode(&jpeg, JpegScale::None, &mut out)
                .unwrap_err();
            assert!(matches!(err, Error::Decode(_)), "{err}");

            ImageDecoder::with_max_decode_bytes(64 * 1024)
                .decode(&jpeg, JpegScale::None, &mut out)
                .unwrap();
            assert_eq!((out.width(), out.height()), (64, 48));
        }
    }
}
