//! The scheduler-facing player.
//!
//! The caller owns the timer and calls [`Player::tick`] periodically. Each
//! tick passes two gates: the initialization gate opens the source when it is
//! not ready and its retry timer allows, and the frame gate runs the pipeline
//! once the update interval has elapsed since the last delivered frame.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::PoolSet;
use crate::decode::JpegDecoder;
use crate::display::Display;
use crate::header::{ParsedHeader, DEFAULT_FPS};
use crate::pipeline::{DropReason, FrameOutcome, FramePipeline, NoFrameReason, DEFAULT_PIXEL_BUDGET};
use crate::source::file::{FileOptions, DEFAULT_BUFFER_CEILING, MIN_BUFFER_LEN};
use crate::source::http::{FillMode, HttpOptions, HttpSource};
use crate::source::transport::{HttpTimeouts, HttpTransport};
use crate::source::{FileSource, Source, SourceConfig, SourceDriver};
use crate::{Error, Result};

/// Validated player configuration.
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub source: SourceConfig,
    /// Fixed frame interval; derived from the stream's FPS when `None`.
    pub update_interval: Option<Duration>,
    pub looping: bool,
    pub http: HttpOptions,
    pub file: FileOptions,
    /// Ceiling for the decoded RGB565 frame, in bytes.
    pub pixel_budget: usize,
}

impl PlayerOptions {
    pub fn builder() -> PlayerOptionsBuilder {
        PlayerOptionsBuilder::new()
    }
}

/// Builder for configuring [`PlayerOptions`] with method chaining.
#[derive(Debug, Clone, Default)]
pub struct PlayerOptionsBuilder {
    source: Option<SourceConfig>,
    update_interval: Option<Duration>,
    looping: Option<bool>,
    retry_backoff: Option<Duration>,
    chunk_size: Option<usize>,
    http_buffer_ceiling: Option<usize>,
    http_min_buffer: Option<usize>,
    timeouts: Option<HttpTimeouts>,
    fill_budget: Option<Duration>,
    fill_mode: Option<FillMode>,
    lock_timeout: Option<Duration>,
    file_buffer_ceiling: Option<usize>,
    pixel_budget: Option<usize>,
    pools: Option<Arc<PoolSet>>,
}

impl PlayerOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Play a local container or raw JPEG file.
    pub fn file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.source = Some(SourceConfig::File(path.into()));
        self
    }

    /// Play an HTTP stream.
    pub fn http<S: Into<String>>(mut self, url: S) -> Self {
        self.source = Some(SourceConfig::Http(url.into()));
        self
    }

    /// Override the frame interval derived from the stream header.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Restart from the first frame at end of stream (default `true`).
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = Some(looping);
        self
    }

    /// Delay between failed open attempts (default 5 s).
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    pub fn http_buffer_ceiling(mut self, bytes: usize) -> Self {
        self.http_buffer_ceiling = Some(bytes);
        self
    }

    pub fn http_min_buffer(mut self, bytes: usize) -> Self {
        self.http_min_buffer = Some(bytes);
        self
    }

    pub fn timeouts(mut self, timeouts: HttpTimeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Wall-clock limit of one pull fill.
    pub fn fill_budget(mut self, budget: Duration) -> Self {
        self.fill_budget = Some(budget);
        self
    }

    pub fn fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = Some(mode);
        self
    }

    /// Bounded wait for the shared HTTP buffer lock (default 1 s).
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn file_buffer_ceiling(mut self, bytes: usize) -> Self {
        self.file_buffer_ceiling = Some(bytes);
        self
    }

    pub fn pixel_budget(mut self, bytes: usize) -> Self {
        self.pixel_budget = Some(bytes);
        self
    }

    /// Memory pools stream buffers are allocated from.
    pub fn pools(mut self, pools: Arc<PoolSet>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Validate and build the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] when no source is set, a URL is
    /// not HTTP, or a size or duration is zero or inconsistent.
    pub fn build(self) -> Result<PlayerOptions> {
        let invalid = |msg: &str| Err(Error::InvalidConfiguration(msg.into()));

        let source = match self.source {
            Some(source) => source,
            None => return invalid("a file or http source is required"),
        };
        match &source {
            SourceConfig::File(path) if path.as_os_str().is_empty() => {
                return invalid("file path is empty")
            }
            SourceConfig::Http(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(Error::InvalidConfiguration(format!(
                    "'{url}' is not an http:// or https:// URL"
                )))
            }
            _ => {}
        }

        if self.update_interval.is_some_and(|d| d.is_zero()) {
            return invalid("update interval must be non-zero");
        }

        let pools = self.pools.unwrap_or_else(PoolSet::system);
        let retry_backoff = self.retry_backoff.unwrap_or(crate::source::http::DEFAULT_RETRY_BACKOFF);
        let defaults = HttpOptions::default();
        let http = HttpOptions {
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            buffer_ceiling: self.http_buffer_ceiling.unwrap_or(defaults.buffer_ceiling),
            min_buffer: self.http_min_buffer.unwrap_or(defaults.min_buffer),
            timeouts: self.timeouts.unwrap_or(defaults.timeouts),
            fill_budget: self.fill_budget.unwrap_or(defaults.fill_budget),
            fill_mode: self.fill_mode.unwrap_or(defaults.fill_mode),
            lock_timeout: self.lock_timeout.unwrap_or(defaults.lock_timeout),
            retry_backoff,
            pools: Arc::clone(&pools),
        };

        if http.chunk_size == 0 {
            return invalid("chunk size must be non-zero");
        }
        if http.min_buffer < crate::header::MIN_HEADER_LEN || http.min_buffer > http.buffer_ceiling {
            return Err(Error::InvalidConfiguration(format!(
                "http minimum buffer {} must be between {} and the ceiling {}",
                http.min_buffer,
                crate::header::MIN_HEADER_LEN,
                http.buffer_ceiling
            )));
        }
        if http.timeouts.connect.is_zero()
            || http.timeouts.response.is_zero()
            || http.timeouts.read.is_zero()
            || http.lock_timeout.is_zero()
            || http.fill_budget.is_zero()
        {
            return invalid("timeouts and fill budget must be non-zero");
        }

        let file_ceiling = self.file_buffer_ceiling.unwrap_or(DEFAULT_BUFFER_CEILING);
        if file_ceiling < crate::header::MIN_HEADER_LEN {
            return invalid("file buffer ceiling is too small to hold a header");
        }
        let file = FileOptions {
            buffer_ceiling: file_ceiling,
            min_buffer: MIN_BUFFER_LEN.min(file_ceiling),
            retry_backoff,
            pools,
        };

        let pixel_budget = self.pixel_budget.unwrap_or(DEFAULT_PIXEL_BUDGET);
        if pixel_budget == 0 {
            return invalid("pixel budget must be non-zero");
        }

        Ok(PlayerOptions {
            source,
            update_interval: self.update_interval,
            looping: self.looping.unwrap_or(true),
            http,
            file,
            pixel_budget,
        })
    }
}

/// Progress through the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackState {
    /// Frames delivered so far.
    pub current_frame: u32,
    /// When the last frame was delivered.
    pub last_update: Option<Instant>,
    pub update_interval: Duration,
    /// Timestamp of the last delivered frame, when the stream carries one.
    pub last_timestamp_ms: Option<u32>,
}

impl PlaybackState {
    fn new(update_interval: Duration) -> Self {
        Self {
            current_frame: 0,
            last_update: None,
            update_interval,
            last_timestamp_ms: None,
        }
    }

    /// True when the frame gate is open at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_update {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.update_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerStatus {
    /// The source is not open; the next allowed tick tries again.
    Uninitialized,
    Ready,
    /// A fatal error occurred. Ticks do nothing.
    Failed(String),
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerStatus::Uninitialized => f.write_str("uninitialized"),
            PlayerStatus::Ready => f.write_str("ready"),
            PlayerStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The frame interval has not elapsed.
    NotDue,
    /// The source is not open and could not be opened this tick.
    Waiting,
    /// The pipeline ran.
    Frame(FrameOutcome),
    /// The player has failed permanently.
    Failed,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerStats {
    pub delivered: u64,
    pub decode_failures: u64,
    pub corrupt_frames: u64,
    pub oversized_frames: u64,
    pub empty_ticks: u64,
    pub open_attempts: u64,
    pub failed_opens: u64,
}

/// Plays one stream onto one display.
pub struct Player<D, J, S = SourceDriver> {
    options: PlayerOptions,
    source: S,
    display: D,
    pipeline: FramePipeline<J>,
    state: PlaybackState,
    status: PlayerStatus,
    stats: PlayerStats,
    header: Option<ParsedHeader>,
}

impl<D, J, S> fmt::Debug for Player<D, J, S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("source", &self.source)
            .field("status", &self.status)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<D: Display, J: JpegDecoder> Player<D, J> {
    /// Create a player for the configured source.
    ///
    /// File sources are opened immediately; HTTP sources connect on the first
    /// tick through the built-in transport.
    ///
    /// # Errors
    ///
    /// Fails with a fatal error when the display has no drawable area, the
    /// file cannot be opened or its format is unrecognized.
    pub fn new(options: PlayerOptions, display: D, decoder: J) -> Result<Self> {
        let source = match &options.source {
            SourceConfig::File(path) => {
                SourceDriver::File(FileSource::new(path, options.file.clone()))
            }
            #[cfg(feature = "http")]
            SourceConfig::Http(url) => {
                SourceDriver::Http(HttpSource::new(url.clone(), options.http.clone()))
            }
            #[cfg(not(feature = "http"))]
            SourceConfig::Http(_) => {
                return Err(Error::InvalidConfiguration(
                    "built without the `http` feature; use Player::with_http_transport".into(),
                ))
            }
        };
        Self::with_source(options, source, display, decoder)
    }

    /// Create an HTTP player that connects through `transport`.
    pub fn with_http_transport<T>(
        options: PlayerOptions,
        display: D,
        decoder: J,
        transport: T,
    ) -> Result<Self>
    where
        T: HttpTransport + 'static,
    {
        let SourceConfig::Http(url) = &options.source else {
            return Err(Error::InvalidConfiguration(
                "an http transport needs an http source".into(),
            ));
        };
        let source = HttpSource::with_transport(url.clone(), options.http.clone(), transport);
        Self::with_source(options, SourceDriver::Http(source), display, decoder)
    }
}

impl<D: Display, J: JpegDecoder, S: Source> Player<D, J, S> {
    /// Create a player around an already constructed source.
    pub fn with_source(options: PlayerOptions, source: S, display: D, decoder: J) -> Result<Self> {
        if display.width() == 0 || display.height() == 0 {
            return Err(Error::DisplayUnavailable(format!(
                "display has no drawable area ({}x{})",
                display.width(),
                display.height()
            )));
        }

        let interval = options
            .update_interval
            .unwrap_or(Duration::from_millis(1000 / u64::from(DEFAULT_FPS)));
        let pipeline = FramePipeline::new(decoder, options.pixel_budget);

        let mut player = Self {
            options,
            source,
            display,
            pipeline,
            state: PlaybackState::new(interval),
            status: PlayerStatus::Uninitialized,
            stats: PlayerStats::default(),
            header: None,
        };

        if player.source.kind() == crate::source::VideoSource::File {
            if let Err(e) = player.try_open(Instant::now()) {
                if e.is_fatal() {
                    return Err(e);
                }
            }
        }

        Ok(player)
    }

    /// Run one tick at the current time.
    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// Run one tick as if the time were `now`.
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        if matches!(self.status, PlayerStatus::Failed(_)) {
            return TickOutcome::Failed;
        }

        if !self.source.is_ready() {
            if self.source.next_attempt().is_some_and(|at| now < at) {
                return TickOutcome::Waiting;
            }
            match self.try_open(now) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return TickOutcome::Failed,
                Err(_) => return TickOutcome::Waiting,
            }
        }

        if !self.state.is_due(now) {
            return TickOutcome::NotDue;
        }

        let outcome = match self.pipeline.produce_next_frame(
            &mut self.source,
            &mut self.display,
            self.options.looping,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(&e);
                return TickOutcome::Failed;
            }
        };

        self.record(&outcome, now);
        TickOutcome::Frame(outcome)
    }

    /// When the next tick has work to do, or `None` once the player has failed.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if matches!(self.status, PlayerStatus::Failed(_)) {
            return None;
        }
        let due = if self.source.is_ready() {
            self.state.last_update.map(|last| last + self.state.update_interval)
        } else {
            self.source.next_attempt()
        };
        Some(due.map_or(now, |at| at.max(now)))
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn status(&self) -> &PlayerStatus {
        &self.status
    }

    pub fn stats(&self) -> &PlayerStats {
        &self.stats
    }

    pub fn options(&self) -> &PlayerOptions {
        &self.options
    }

    /// Header of the open stream.
    pub fn header(&self) -> Option<&ParsedHeader> {
        self.header.as_ref()
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn pipeline(&self) -> &FramePipeline<J> {
        &self.pipeline
    }

    /// Release the display.
    pub fn into_display(self) -> D {
        self.display
    }

    fn try_open(&mut self, now: Instant) -> Result<()> {
        self.stats.open_attempts += 1;
        match self.source.open(now) {
            Ok(parsed) => {
                self.on_opened(parsed);
                Ok(())
            }
            Err(e) => {
                self.stats.failed_opens += 1;
                if e.is_fatal() {
                    self.fail(&e);
                } else {
                    log::debug!("Source not ready: {}", e);
                    self.status = PlayerStatus::Uninitialized;
                }
                Err(e)
            }
        }
    }

    fn on_opened(&mut self, parsed: ParsedHeader) {
        self.pipeline
            .configure(&parsed, self.display.width(), self.display.height());
        self.state.update_interval = self
            .options
            .update_interval
            .unwrap_or_else(|| parsed.header.frame_interval());
        self.header = Some(parsed);
        self.status = PlayerStatus::Ready;
        self.log_config();
    }

    fn record(&mut self, outcome: &FrameOutcome, now: Instant) {
        match outcome {
            FrameOutcome::Delivered(info) => {
                self.stats.delivered += 1;
                self.state.current_frame = self.state.current_frame.wrapping_add(1);
                self.state.last_update = Some(now);
                self.state.last_timestamp_ms = info.timestamp;
            }
            FrameOutcome::Dropped(reason) => match reason {
                DropReason::DecodeFailed => self.stats.decode_failures += 1,
                DropReason::CorruptFrame => self.stats.corrupt_frames += 1,
                DropReason::FrameTooLarge => self.stats.oversized_frames += 1,
            },
            FrameOutcome::NoFrame(reason) => {
                self.stats.empty_ticks += 1;
                if !self.source.is_ready() {
                    self.status = PlayerStatus::Uninitialized;
                }
                if *reason == NoFrameReason::EndOfStream {
                    log::trace!("Stream finished after {} frames", self.state.current_frame);
                }
            }
        }
    }

    fn fail(&mut self, err: &Error) {
        log::error!("Video player failed: {}", err);
        self.status = PlayerStatus::Failed(err.to_string());
        self.source.close();
    }

    fn log_config(&self) {
        let Some(parsed) = &self.header else {
            return;
        };
        let header = &parsed.header;

        log::info!("Video player:");
        log::info!("  Resolution: {}x{}", header.width, header.height);
        log::info!("  Frames: {}", header.frame_count);
        log::info!("  FPS: {}", header.fps);
        log::info!("  Format: {:?}", parsed.format);
        log::info!("  Source: {}", self.options.source);
        log::info!(
            "  Display: {}x{}, decode scale 1/{}",
            self.display.width(),
            self.display.height(),
            self.pipeline.scale().divisor()
        );
        log::info!("  Update interval: {:?}", self.state.update_interval);
        if parsed.repairs.any() {
            log::info!("  Header repairs: {:?}", parsed.repairs);
        }
    }
}
