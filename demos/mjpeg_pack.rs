//! Example: Packing JPEG files into an MJPEG container.
//!
//! Frames are stamped at the given frame rate and the stream dimensions are
//! taken from the first JPEG.
//!
//! Run with: `cargo run --example mjpeg_pack -- out.mjpeg 30 frame0.jpg frame1.jpg ...`
//!
//! Without input files a short synthetic test pattern is written instead.

use std::{
    env, fs,
    fs::File,
    io::{BufWriter, Write},
};

use mjpeg_stream::{container::MjpegWriter, header::jpeg_dimensions, Error, StreamHeader};

/// A moving bar, encoded with `jpeg-encoder`.
fn test_pattern(frames: usize) -> Result<Vec<Vec<u8>>, Error> {
    const W: u16 = 160;
    const H: u16 = 120;

    (0..frames)
        .map(|i| {
            let bar = (i * 8) % usize::from(W);
            let rgb: Vec<u8> = (0..usize::from(W) * usize::from(H))
                .flat_map(|p| {
                    let x = p % usize::from(W);
                    if x.abs_diff(bar) < 8 {
                        [250, 250, 250]
                    } else {
                        [20, (x * 255 / usize::from(W)) as u8, 120]
                    }
                })
                .collect();
            let mut jpeg = Vec::new();
            jpeg_encoder::Encoder::new(&mut jpeg, 85)
                .encode(&rgb, W, H, jpeg_encoder::ColorType::Rgb)
                .map_err(|e| Error::Decode(e.to_string()))?;
            Ok(jpeg)
        })
        .collect()
}

fn main() -> Result<(), Error> {
    let args: Vec<String> = env::args().collect();
    let out_path = args.get(1).map_or("test_pattern.mjpeg", String::as_str);
    let fps: u32 = match args.get(2) {
        Some(fps) => fps
            .parse()
            .map_err(|_| Error::InvalidConfiguration(format!("'{fps}' is not a frame rate")))?,
        None => 30,
    };

    let frames = if args.len() > 3 {
        args[3..].iter().map(fs::read).collect::<Result<Vec<_>, _>>()?
    } else {
        println!("No input frames given, writing a test pattern");
        test_pattern(60)?
    };

    let (width, height) = frames
        .first()
        .and_then(|jpeg| jpeg_dimensions(jpeg))
        .ok_or_else(|| Error::InvalidConfiguration("first frame is not a JPEG".into()))?;

    let header = StreamHeader::new(u32::from(width), u32::from(height), frames.len() as u32, fps);
    let interval = header.frame_interval().as_millis() as u32;
    let mut writer = MjpegWriter::new(BufWriter::new(File::create(out_path)?), &header)?;
    for (i, frame) in frames.iter().enumerate() {
        writer.push_frame(frame, i as u32 * interval)?;
    }
    writer.finish()?.flush()?;

    println!("Wrote {} ({})", out_path, header);
    Ok(())
}
