//! HTTP source.
//!
//! Connection attempts are rate limited by a retry timer and never fail the
//! player: network errors, timeouts, bad statuses and allocation failures all
//! leave the source unopened until the next attempt. Only a stream with no
//! recognizable structure is fatal.
//!
//! Bytes reach the buffer in one of two ways. In [`FillMode::Pull`] the tick
//! reads fixed-size chunks from the response body until the buffer is full,
//! the body ends or the fill budget runs out. In [`FillMode::Push`] a
//! background thread reads the body and appends every chunk through a
//! [`ChunkSink`], dropping whatever does not fit.
//!
//! Either way the body is read through a [`WatchedBody`], so a server that
//! stops sending turns into [`Error::Timeout`] after
//! [`HttpTimeouts::read`] instead of blocking a tick.

use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::buffer::{BoundedBuffer, ChunkSink, PoolSet, SharedBuffer};
use crate::header::{self, ParsedHeader, MIN_HEADER_LEN};
use crate::source::transport::{HttpResponse, HttpTimeouts, HttpTransport};
use crate::source::{EndOfStream, FillStatus, Source, VideoSource};
use crate::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_BUFFER_CEILING: usize = 256 * 1024;
pub const DEFAULT_MIN_BUFFER: usize = 32 * 1024;
pub const DEFAULT_FILL_BUDGET: Duration = Duration::from_millis(50);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// How response bytes are moved into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// The tick reads chunks itself.
    #[default]
    Pull,
    /// A network thread appends chunks as they arrive.
    Push,
}

/// Tuning for [`HttpSource`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub chunk_size: usize,
    pub buffer_ceiling: usize,
    pub min_buffer: usize,
    pub timeouts: HttpTimeouts,
    /// Wall-clock limit for one pull fill.
    pub fill_budget: Duration,
    pub fill_mode: FillMode,
    /// Bounded wait for the shared buffer lock.
    pub lock_timeout: Duration,
    pub retry_backoff: Duration,
    pub pools: Arc<PoolSet>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_ceiling: DEFAULT_BUFFER_CEILING,
            min_buffer: DEFAULT_MIN_BUFFER,
            timeouts: HttpTimeouts::default(),
            fill_budget: DEFAULT_FILL_BUDGET,
            fill_mode: FillMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            pools: PoolSet::system(),
        }
    }
}

#[derive(Debug, Default)]
struct PushState {
    stop: AtomicBool,
    finished: AtomicBool,
    failed: AtomicBool,
    received: AtomicU64,
}

enum Feed {
    Pull {
        body: Box<dyn Read + Send>,
        eof: bool,
    },
    Push {
        state: Arc<PushState>,
        seen: u64,
        _handle: JoinHandle<()>,
    },
}

struct Connection {
    buffer: Arc<SharedBuffer>,
    feed: Feed,
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The push thread may be blocked in a read; it exits on its next wakeup.
        if let Feed::Push { state, .. } = &self.feed {
            state.stop.store(true, Ordering::Release);
        }
    }
}

/// Streams a container or raw JPEG stream from an HTTP URL.
pub struct HttpSource {
    url: String,
    options: HttpOptions,
    transport: Box<dyn HttpTransport>,
    conn: Option<Connection>,
    next_attempt: Option<Instant>,
    failed_attempts: u32,
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSource")
            .field("url", &self.url)
            .field("fill_mode", &self.options.fill_mode)
            .field("connected", &self.conn.is_some())
            .field("next_attempt", &self.next_attempt)
            .field("failed_attempts", &self.failed_attempts)
            .finish()
    }
}

impl HttpSource {
    /// Create a source using the built-in `ureq` transport.
    #[cfg(feature = "http")]
    pub fn new<S: Into<String>>(url: S, options: HttpOptions) -> Self {
        Self::with_transport(url, options, super::transport::UreqTransport::new())
    }

    pub fn with_transport<S, T>(url: S, options: HttpOptions, transport: T) -> Self
    where
        S: Into<String>,
        T: HttpTransport + 'static,
    {
        Self {
            url: url.into(),
            options,
            transport: Box::new(transport),
            conn: None,
            next_attempt: None,
            failed_attempts: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Consecutive failed open attempts.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Bytes the push thread had to drop because the buffer was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.conn
            .as_ref()
            .map_or(0, |conn| conn.buffer.dropped_bytes())
    }

    pub fn buffer_capacity(&self) -> Option<usize> {
        let conn = self.conn.as_ref()?;
        let buffer = conn.buffer.lock(self.options.lock_timeout).ok()?;
        Some(buffer.capacity())
    }

    fn connect(&mut self) -> Result<ParsedHeader> {
        let HttpResponse {
            status,
            content_length,
            body,
        } = self.transport.open(&self.url, &self.options.timeouts)?;
        if status != 200 {
            return Err(Error::HttpStatus(status));
        }
        let mut body: Box<dyn Read + Send> = Box::new(WatchedBody::spawn(
            body,
            self.options.chunk_size,
            self.options.timeouts.read,
        )?);

        let ceiling = self.options.buffer_ceiling;
        let target = content_length
            .map_or(ceiling, |len| usize::try_from(len).unwrap_or(usize::MAX))
            .min(ceiling);
        let mut buffer = self.options.pools.allocate(target, self.options.min_buffer)?;

        let (parsed, eof) = self.read_header(&mut buffer, &mut body)?;
        buffer.mark_payload_start(parsed.payload_offset);

        log::info!(
            "Connected to {} ({}, {}-byte buffer, {:?} fill): {}",
            self.url,
            content_length.map_or_else(|| "unknown length".to_string(), |len| format!("{len} bytes")),
            buffer.capacity(),
            self.options.fill_mode,
            parsed.header
        );

        let buffer = SharedBuffer::new(buffer);
        let feed = match self.options.fill_mode {
            FillMode::Pull => Feed::Pull { body, eof },
            FillMode::Push => {
                let state = Arc::new(PushState::default());
                if eof {
                    state.finished.store(true, Ordering::Release);
                }
                let sink = ChunkSink::new(Arc::clone(&buffer), self.options.lock_timeout);
                let thread_state = Arc::clone(&state);
                let chunk_size = self.options.chunk_size;
                let handle = thread::Builder::new()
                    .name("mjpeg-http-push".into())
                    .spawn(move || {
                        if !eof {
                            push_loop(body, sink, &thread_state, chunk_size);
                        }
                        thread_state.finished.store(true, Ordering::Release);
                    })?;
                Feed::Push {
                    state,
                    seen: 0,
                    _handle: handle,
                }
            }
        };

        self.conn = Some(Connection { buffer, feed });
        Ok(parsed)
    }

    /// Read the opening bytes and parse the header.
    ///
    /// Up to one chunk is collected first so that a JPEG marker preceded by
    /// multipart text is still found. When the response timeout expires any
    /// complete header already received is used.
    fn read_header(
        &self,
        buffer: &mut BoundedBuffer,
        body: &mut Box<dyn Read + Send>,
    ) -> Result<(ParsedHeader, bool)> {
        let deadline = Instant::now() + self.options.timeouts.response;
        let opening_len = self
            .options
            .chunk_size
            .max(MIN_HEADER_LEN)
            .min(buffer.capacity());
        let mut eof = false;

        loop {
            let timed_out = Instant::now() >= deadline;
            if eof || buffer.used() >= opening_len || (timed_out && buffer.used() >= MIN_HEADER_LEN) {
                return header::parse(buffer.filled()).map(|parsed| (parsed, eof));
            }
            if timed_out {
                return Err(Error::Timeout(format!("{}: stream header", self.url)));
            }

            match buffer.fill_from(body, self.options.chunk_size) {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(map_read_error(&self.url, e)),
            }
        }
    }

    fn schedule_retry(&mut self, now: Instant, err: &Error) {
        self.failed_attempts += 1;
        self.next_attempt = Some(now + self.options.retry_backoff);
        log::warn!(
            "HTTP source {} unavailable ({}), attempt {}, retrying in {:?}",
            self.url,
            err,
            self.failed_attempts,
            self.options.retry_backoff
        );
    }
}

/// Response body whose reads give up after `timeout` without new bytes.
///
/// A helper thread does the blocking reads and hands chunks over a one-slot
/// channel, so at most two chunks are in flight. The thread exits when its
/// pending read returns after the reader has been dropped.
struct WatchedBody {
    chunks: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    timeout: Duration,
    done: bool,
}

impl WatchedBody {
    fn spawn(mut body: Box<dyn Read + Send>, chunk_size: usize, timeout: Duration) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("mjpeg-http-read".into())
            .spawn(move || {
                let mut chunk = vec![0u8; chunk_size];
                loop {
                    let result = match body.read(&mut chunk) {
                        Ok(n) => Ok(chunk[..n].to_vec()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => Err(e),
                    };
                    let last = !matches!(&result, Ok(bytes) if !bytes.is_empty());
                    if tx.send(result).is_err() || last {
                        return;
                    }
                }
            })?;
        Ok(Self {
            chunks: rx,
            pending: Vec::new(),
            offset: 0,
            timeout,
            done: false,
        })
    }
}

impl Read for WatchedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset == self.pending.len() {
            if self.done {
                return Ok(0);
            }
            match self.chunks.recv_timeout(self.timeout) {
                Ok(Ok(chunk)) if !chunk.is_empty() => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Ok(Ok(_)) | Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    return Ok(0);
                }
                Ok(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no body data for {:?}", self.timeout),
                    ));
                }
            }
        }

        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

fn map_read_error(url: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            Error::Timeout(format!("{url}: {err}"))
        }
        _ => Error::NetworkUnavailable(format!("{url}: {err}")),
    }
}

fn push_loop(mut body: Box<dyn Read + Send>, sink: ChunkSink, state: &PushState, chunk_size: usize) {
    let mut chunk = vec![0u8; chunk_size];
    while !state.stop.load(Ordering::Acquire) {
        match body.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => match sink.try_append(&chunk[..n]) {
                Ok(accepted) => {
                    state.received.fetch_add(accepted as u64, Ordering::AcqRel);
                }
                Err(e) => log::warn!("Dropped {} byte chunk: {}", n, e),
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("HTTP stream read failed: {}", e);
                state.failed.store(true, Ordering::Release);
                return;
            }
        }
    }
}

impl Source for HttpSource {
    fn kind(&self) -> VideoSource {
        VideoSource::Http
    }

    fn is_ready(&self) -> bool {
        self.conn.is_some()
    }

    fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    fn open(&mut self, now: Instant) -> Result<ParsedHeader> {
        if self.next_attempt.is_some_and(|at| now < at) {
            return Err(Error::NotReady("HTTP retry timer has not elapsed"));
        }

        self.close();
        match self.connect() {
            Ok(parsed) => {
                self.next_attempt = None;
                self.failed_attempts = 0;
                Ok(parsed)
            }
            Err(e) => {
                self.close();
                if !e.is_fatal() {
                    self.schedule_retry(now, &e);
                }
                Err(e)
            }
        }
    }

    fn fill(&mut self) -> Result<FillStatus> {
        let chunk_size = self.options.chunk_size;
        let fill_budget = self.options.fill_budget;
        let lock_timeout = self.options.lock_timeout;

        let conn = self
            .conn
            .as_mut()
            .ok_or(Error::NotReady("HTTP source is not connected"))?;

        let result = match &mut conn.feed {
            Feed::Pull { body, eof } => {
                if *eof {
                    return Ok(FillStatus {
                        added: 0,
                        end_of_stream: true,
                    });
                }

                let mut buffer = conn.buffer.lock(lock_timeout)?;
                if buffer.free() < chunk_size {
                    buffer.compact();
                }

                let start = Instant::now();
                let mut added = 0;
                let mut failure = None;
                while buffer.free() > 0 {
                    match buffer.fill_from(body, chunk_size) {
                        Ok(0) => {
                            *eof = true;
                            break;
                        }
                        Ok(n) => added += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            failure = Some(map_read_error(&self.url, e));
                            break;
                        }
                    }
                    if start.elapsed() >= fill_budget {
                        break;
                    }
                    thread::yield_now();
                }

                match failure {
                    Some(e) => Err(e),
                    None => Ok(FillStatus {
                        added,
                        end_of_stream: *eof,
                    }),
                }
            }
            Feed::Push { state, seen, .. } => {
                if state.failed.load(Ordering::Acquire) {
                    Err(Error::NetworkUnavailable(format!(
                        "{}: stream interrupted",
                        self.url
                    )))
                } else {
                    let received = state.received.load(Ordering::Acquire);
                    let added = (received - *seen) as usize;
                    *seen = received;
                    Ok(FillStatus {
                        added,
                        end_of_stream: added == 0 && state.finished.load(Ordering::Acquire),
                    })
                }
            }
        };

        if let Err(e) = &result {
            if !matches!(e, Error::LockTimeout(_)) {
                self.close();
                self.schedule_retry(Instant::now(), e);
            }
        }
        result
    }

    fn on_end_of_stream(&mut self, looping: bool) -> Result<EndOfStream> {
        if !looping {
            return Ok(EndOfStream::Exhausted);
        }

        if let Some(conn) = &self.conn {
            let complete = match &conn.feed {
                Feed::Pull { eof, .. } => *eof,
                Feed::Push { state, .. } => state.finished.load(Ordering::Acquire),
            };
            if complete && conn.buffer.lock(self.options.lock_timeout)?.rewind() {
                log::debug!("Looping {} from memory", self.url);
                return Ok(EndOfStream::Restarted);
            }
        }

        log::debug!("End of {}, reconnecting", self.url);
        self.close();
        self.next_attempt = None;
        Ok(EndOfStream::Reconnecting)
    }

    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut BoundedBuffer) -> R) -> Result<R> {
        let conn = self
            .conn
            .as_ref()
            .ok_or(Error::NotReady("HTTP source is not connected"))?;
        let mut buffer = conn.buffer.lock(self.options.lock_timeout)?;
        Ok(f(&mut buffer))
    }

    fn close(&mut self) {
        self.conn = None;
    }
}
