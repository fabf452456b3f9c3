//! Unit tests for the mjpeg-stream library.

use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    error::{Error, Severity},
    header::StreamHeader,
    locator::LocateError,
    pipeline::{FrameOutcome, NoFrameReason},
    player::{Player, PlayerOptions, PlayerStatus, TickOutcome},
    source::transport::{HttpResponse, HttpTimeouts, HttpTransport},
    test_support::{container, jpeg_stub, CountingDisplay, MemorySource, StubDecoder},
    FrameBufferDisplay, Result,
};

fn memory_player(stream: Vec<u8>, options: PlayerOptions) -> Player<CountingDisplay, StubDecoder, MemorySource> {
    Player::with_source(
        options,
        MemorySource::new(stream, 64),
        CountingDisplay::new(16, 16),
        StubDecoder::default(),
    )
    .unwrap()
}

fn two_frame_stream(fps: u32) -> Vec<u8> {
    container(
        StreamHeader::new(16, 16, 2, fps),
        &[jpeg_stub(16, 16, 8), jpeg_stub(16, 16, 12)],
    )
}

fn delivered(outcome: &TickOutcome) -> bool {
    matches!(outcome, TickOutcome::Frame(frame) if frame.is_delivered())
}

/// Serves `body` after failing the first `failures` connects.
struct FlakyTransport {
    failures: usize,
    body: Vec<u8>,
    opens: Arc<AtomicUsize>,
}

impl HttpTransport for FlakyTransport {
    fn open(&mut self, _url: &str, _timeouts: &HttpTimeouts) -> Result<HttpResponse> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.failures > 0 {
            self.failures -= 1;
            return Err(Error::NetworkUnavailable("link down".into()));
        }
        Ok(HttpResponse {
            status: 200,
            content_length: Some(self.body.len() as u64),
            body: Box::new(Cursor::new(self.body.clone())),
        })
    }
}

#[test]
fn test_error_severities() {
    let fatal = [
        Error::DisplayUnavailable("none".into()),
        Error::UnrecognizedFormat(0),
        Error::InvalidConfiguration("bad".into()),
    ];
    for err in &fatal {
        assert_eq!(err.severity(), Severity::Fatal, "{err}");
    }

    let retryable = [
        Error::NetworkUnavailable("down".into()),
        Error::HttpStatus(503),
        Error::Timeout("connect".into()),
        Error::LockTimeout(Duration::from_secs(1)),
        Error::InsufficientData {
            needed: 20,
            available: 3,
        },
        Error::AllocationFailed {
            requested: 1 << 20,
            minimum: 1 << 14,
        },
    ];
    for err in &retryable {
        assert_eq!(err.severity(), Severity::Retryable, "{err}");
    }

    assert_eq!(
        Error::from(LocateError::CorruptFrame { size: 0 }).severity(),
        Severity::PerFrame
    );
    assert_eq!(Error::Decode("bad huffman".into()).severity(), Severity::PerFrame);
}

#[test]
fn test_at_most_one_frame_per_interval() {
    let options = PlayerOptions::builder().file("memory").build().unwrap();
    let mut player = memory_player(two_frame_stream(10), options);
    let start = Instant::now();

    assert_eq!(player.state().update_interval, Duration::from_millis(100));
    assert!(delivered(&player.tick_at(start)));
    assert_eq!(player.tick_at(start + Duration::from_millis(50)), TickOutcome::NotDue);
    assert_eq!(player.tick_at(start + Duration::from_millis(99)), TickOutcome::NotDue);
    assert!(delivered(&player.tick_at(start + Duration::from_millis(100))));

    assert_eq!(player.state().current_frame, 2);
    assert_eq!(player.display().presented, 2);
    assert_eq!(player.state().last_timestamp_ms, Some(33));
}

#[test]
fn test_interval_override() {
    let options = PlayerOptions::builder()
        .file("memory")
        .update_interval(Duration::from_millis(40))
        .build()
        .unwrap();
    let player = memory_player(two_frame_stream(10), options);

    assert_eq!(player.state().update_interval, Duration::from_millis(40));
}

#[test]
fn test_next_deadline_follows_interval() {
    let options = PlayerOptions::builder().file("memory").build().unwrap();
    let mut player = memory_player(two_frame_stream(20), options);
    let start = Instant::now();

    assert_eq!(player.next_deadline(start), Some(start));
    player.tick_at(start);
    assert_eq!(
        player.next_deadline(start),
        Some(start + Duration::from_millis(50))
    );
}

#[test]
fn test_loops_by_default() {
    let options = PlayerOptions::builder()
        .file("memory")
        .update_interval(Duration::from_millis(1))
        .build()
        .unwrap();
    let mut player = memory_player(two_frame_stream(30), options);
    let start = Instant::now();

    for i in 0..6 {
        assert!(delivered(&player.tick_at(start + Duration::from_millis(i))));
    }
    assert_eq!(player.source().restarts, 2);
    assert_eq!(player.stats().delivered, 6);
}

#[test]
fn test_stops_at_end_without_loop() {
    let options = PlayerOptions::builder()
        .file("memory")
        .update_interval(Duration::from_millis(1))
        .looping(false)
        .build()
        .unwrap();
    let mut player = memory_player(two_frame_stream(30), options);
    let start = Instant::now();

    player.tick_at(start);
    player.tick_at(start + Duration::from_millis(1));
    assert_eq!(
        player.tick_at(start + Duration::from_millis(2)),
        TickOutcome::Frame(FrameOutcome::NoFrame(NoFrameReason::EndOfStream))
    );
    assert_eq!(player.status(), &PlayerStatus::Ready);
    assert_eq!(player.stats().empty_ticks, 1);
    assert_eq!(player.display().presented, 2);
}

#[test]
fn test_dropped_frame_is_counted_and_playback_continues() {
    let bad = vec![0xFF, 0xD8, 0x00, 0x00, 0xFF, 0xD9];
    let stream = container(StreamHeader::new(16, 16, 2, 30), &[bad, jpeg_stub(16, 16, 8)]);
    let options = PlayerOptions::builder()
        .file("memory")
        .update_interval(Duration::from_millis(1))
        .build()
        .unwrap();
    let mut player = memory_player(stream, options);
    let start = Instant::now();

    assert!(!delivered(&player.tick_at(start)));
    assert!(delivered(&player.tick_at(start + Duration::from_millis(1))));
    assert_eq!(player.stats().decode_failures, 1);
    assert_eq!(player.state().current_frame, 1);
}

#[test]
fn test_display_without_area_is_fatal() {
    let options = PlayerOptions::builder().file("memory").build().unwrap();
    let err = Player::with_source(
        options,
        MemorySource::new(two_frame_stream(30), 64),
        CountingDisplay::new(0, 0),
        StubDecoder::default(),
    )
    .unwrap_err();

    assert!(matches!(err, Error::DisplayUnavailable(_)));
}

#[test]
fn test_missing_file_is_fatal_on_first_open() {
    let dir = tempfile::tempdir().unwrap();
    let options = PlayerOptions::builder()
        .file(dir.path().join("missing.mjpeg"))
        .build()
        .unwrap();

    let err = Player::new(options, FrameBufferDisplay::new(8, 8), StubDecoder::default()).unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable { .. }));
}

#[test]
fn test_unrecognized_file_is_fatal() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0x42; 64]).unwrap();
    let options = PlayerOptions::builder().file(file.path()).build().unwrap();

    let err = Player::new(options, FrameBufferDisplay::new(8, 8), StubDecoder::default()).unwrap_err();
    assert!(matches!(err, Error::UnrecognizedFormat(_)));
}

#[test]
fn test_http_retries_after_backoff() {
    let opens = Arc::new(AtomicUsize::new(0));
    let transport = FlakyTransport {
        failures: 1,
        body: two_frame_stream(30),
        opens: Arc::clone(&opens),
    };
    let options = PlayerOptions::builder()
        .http("http://camera.local/stream")
        .retry_backoff(Duration::from_secs(5))
        .build()
        .unwrap();
    let mut player = Player::with_http_transport(
        options,
        CountingDisplay::new(16, 16),
        StubDecoder::default(),
        transport,
    )
    .unwrap();
    let start = Instant::now();

    assert_eq!(player.status(), &PlayerStatus::Uninitialized);
    assert_eq!(player.tick_at(start), TickOutcome::Waiting);
    assert_eq!(player.tick_at(start + Duration::from_secs(1)), TickOutcome::Waiting);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(
        player.next_deadline(start),
        Some(start + Duration::from_secs(5))
    );

    assert!(delivered(&player.tick_at(start + Duration::from_secs(5))));
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert_eq!(player.status(), &PlayerStatus::Ready);
    assert_eq!(player.stats().failed_opens, 1);
    assert_eq!(player.header().map(|p| p.header.width), Some(16));
}

#[test]
fn test_http_unrecognized_stream_fails_permanently() {
    let opens = Arc::new(AtomicUsize::new(0));
    let transport = FlakyTransport {
        failures: 0,
        body: vec![0x42; 512],
        opens: Arc::clone(&opens),
    };
    let options = PlayerOptions::builder()
        .http("http://camera.local/stream")
        .build()
        .unwrap();
    let mut player = Player::with_http_transport(
        options,
        CountingDisplay::new(16, 16),
        StubDecoder::default(),
        transport,
    )
    .unwrap();
    let start = Instant::now();

    assert_eq!(player.tick_at(start), TickOutcome::Failed);
    assert_eq!(player.tick_at(start + Duration::from_secs(60)), TickOutcome::Failed);
    assert!(matches!(player.status(), PlayerStatus::Failed(_)));
    assert_eq!(player.next_deadline(start), None);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(player.display().presented, 0);
}

#[test]
fn test_http_transport_requires_http_source() {
    let options = PlayerOptions::builder().file("clip.mjpeg").build().unwrap();
    let transport = FlakyTransport {
        failures: 0,
        body: Vec::new(),
        opens: Arc::new(AtomicUsize::new(0)),
    };

    let err = Player::with_http_transport(
        options,
        CountingDisplay::new(16, 16),
        StubDecoder::default(),
        transport,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
}
