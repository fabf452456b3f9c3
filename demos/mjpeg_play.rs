//! Example: Playing an MJPEG file or HTTP stream into an in-memory display.
//!
//! The player runs until Ctrl-C, the stream ends, or the player fails. The
//! last presented frame is then saved as `mjpeg_play.png`.
//!
//! Run with: `cargo run --example mjpeg_play --features image-decoding -- <file-or-url>`
//!
//! Optional arguments:
//! - display size: `cargo run --example mjpeg_play --features image-decoding -- clip.mjpeg 160x120`

use std::{
    env,
    fs::File,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use mjpeg_stream::{
    Error, FrameBufferDisplay, FrameOutcome, ImageDecoder, NoFrameReason, Player, PlayerOptions,
    TickOutcome,
};

fn parse_size(arg: Option<&String>) -> Result<(u32, u32), Error> {
    let Some(arg) = arg else {
        return Ok((320, 240));
    };
    let invalid = || Error::InvalidConfiguration(format!("display size '{arg}' is not WxH"));
    let (w, h) = arg.split_once('x').ok_or_else(invalid)?;
    Ok((
        w.parse().map_err(|_| invalid())?,
        h.parse().map_err(|_| invalid())?,
    ))
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(target) = args.get(1) else {
        eprintln!("Usage: mjpeg_play <file-or-url> [WxH]");
        return Ok(());
    };
    let (width, height) = parse_size(args.get(2))?;

    // Set up signal handler for graceful shutdown
    let exit_loop = Arc::new(AtomicBool::new(false));
    let exit_loop_clone = exit_loop.clone();
    ctrlc::set_handler(move || {
        exit_loop_clone.store(true, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl-C handler");

    let builder = PlayerOptions::builder().looping(false);
    let builder = if target.starts_with("http://") || target.starts_with("https://") {
        builder.http(target.as_str())
    } else {
        builder.file(target.as_str())
    };
    let mut player = Player::new(
        builder.build()?,
        FrameBufferDisplay::new(width, height),
        ImageDecoder::new(),
    )?;

    let started = Instant::now();
    while !exit_loop.load(Ordering::Relaxed) {
        match player.tick() {
            TickOutcome::Failed => break,
            TickOutcome::Frame(FrameOutcome::NoFrame(NoFrameReason::EndOfStream)) => break,
            _ => {}
        }

        let now = Instant::now();
        match player.next_deadline(now) {
            Some(at) => thread::sleep((at - now).max(Duration::from_millis(1))),
            None => break,
        }
    }

    let stats = player.stats();
    println!(
        "Played {} frames in {:.1?} ({} decode failures, {} corrupt, {} too large)",
        stats.delivered,
        started.elapsed(),
        stats.decode_failures,
        stats.corrupt_frames,
        stats.oversized_frames
    );
    println!("Player status: {}", player.status());

    if player.display().presented() > 0 {
        let png = player.display().encode_png()?;
        File::create("mjpeg_play.png")?.write_all(&png)?;
        println!("Saved last frame to mjpeg_play.png");
    }

    Ok(())
}
