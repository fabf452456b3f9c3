//! File-backed source.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::{BoundedBuffer, PoolSet};
use crate::header::{self, ParsedHeader};
use crate::source::{EndOfStream, FillStatus, Source, VideoSource};
use crate::{Error, Result};

/// Smallest buffer worth opening a file with.
pub const MIN_BUFFER_LEN: usize = 16 * 1024;

/// Default upper bound for the file buffer.
///
/// Files up to this size are held entirely in memory, so looping never
/// touches the disk again.
pub const DEFAULT_BUFFER_CEILING: usize = 2 * 1024 * 1024;

/// Tuning for [`FileSource`].
#[derive(Debug, Clone)]
pub struct FileOptions {
    pub buffer_ceiling: usize,
    pub min_buffer: usize,
    pub retry_backoff: Duration,
    pub pools: Arc<PoolSet>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            buffer_ceiling: DEFAULT_BUFFER_CEILING,
            min_buffer: MIN_BUFFER_LEN,
            retry_backoff: Duration::from_secs(5),
            pools: PoolSet::system(),
        }
    }
}

/// Reads a container or raw JPEG stream from a local file.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    options: FileOptions,
    file: Option<File>,
    buffer: Option<BoundedBuffer>,
    payload_offset: u64,
    eof: bool,
    opened_once: bool,
    next_attempt: Option<Instant>,
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(path: P, options: FileOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            file: None,
            buffer: None,
            payload_offset: 0,
            eof: false,
            opened_once: false,
            next_attempt: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capacity of the current buffer, if open.
    pub fn buffer_capacity(&self) -> Option<usize> {
        self.buffer.as_ref().map(BoundedBuffer::capacity)
    }

    fn try_open(&mut self) -> Result<ParsedHeader> {
        let mut file = File::open(&self.path).map_err(|source| {
            if self.opened_once {
                Error::Io(source)
            } else {
                Error::SourceUnavailable {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;
        self.opened_once = true;

        let file_len = usize::try_from(file.metadata()?.len()).unwrap_or(usize::MAX);
        let target = file_len
            .min(self.options.buffer_ceiling)
            .max(self.options.min_buffer);
        let mut buffer = self.options.pools.allocate(target, self.options.min_buffer)?;

        // A buffer filled to exactly the file length has not seen EOF yet.
        let eof = read_until_full(&mut buffer, &mut file)? || buffer.used() >= file_len;
        let parsed = header::parse(buffer.filled())?;
        buffer.mark_payload_start(parsed.payload_offset);

        log::info!(
            "Opened {} ({} bytes, {}-byte buffer): {}",
            self.path.display(),
            file_len,
            buffer.capacity(),
            parsed.header
        );

        self.payload_offset = parsed.payload_offset as u64;
        self.eof = eof;
        self.file = Some(file);
        self.buffer = Some(buffer);
        Ok(parsed)
    }
}

/// Read until the buffer is full or the reader is exhausted.
///
/// Returns `true` on end of file.
fn read_until_full(buffer: &mut BoundedBuffer, file: &mut File) -> io::Result<bool> {
    while buffer.free() > 0 {
        match buffer.fill_from(file, usize::MAX) {
            Ok(0) => return Ok(true),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

impl Source for FileSource {
    fn kind(&self) -> VideoSource {
        VideoSource::File
    }

    fn is_ready(&self) -> bool {
        self.file.is_some() && self.buffer.is_some()
    }

    fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    fn open(&mut self, now: Instant) -> Result<ParsedHeader> {
        self.close();
        match self.try_open() {
            Ok(parsed) => {
                self.next_attempt = None;
                Ok(parsed)
            }
            Err(e) => {
                self.close();
                if !e.is_fatal() {
                    self.next_attempt = Some(now + self.options.retry_backoff);
                }
                Err(e)
            }
        }
    }

    fn fill(&mut self) -> Result<FillStatus> {
        let (Some(file), Some(buffer)) = (self.file.as_mut(), self.buffer.as_mut()) else {
            return Err(Error::NotReady("file source is not open"));
        };

        if self.eof {
            return Ok(FillStatus {
                added: 0,
                end_of_stream: true,
            });
        }

        buffer.compact();
        let before = buffer.used();
        let pending = buffer.pending_skip();
        self.eof = read_until_full(buffer, file)?;

        Ok(FillStatus {
            added: (buffer.used() - before) + (pending - buffer.pending_skip()),
            end_of_stream: self.eof,
        })
    }

    fn on_end_of_stream(&mut self, looping: bool) -> Result<EndOfStream> {
        if !looping {
            return Ok(EndOfStream::Exhausted);
        }

        let (Some(file), Some(buffer)) = (self.file.as_mut(), self.buffer.as_mut()) else {
            return Err(Error::NotReady("file source is not open"));
        };

        if self.eof && buffer.rewind() {
            log::debug!("Looping {} from memory", self.path.display());
            return Ok(EndOfStream::Restarted);
        }

        file.seek(SeekFrom::Start(self.payload_offset))?;
        buffer.clear();
        self.eof = false;
        log::debug!(
            "Looping {} from offset {}",
            self.path.display(),
            self.payload_offset
        );
        Ok(EndOfStream::Restarted)
    }

    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut BoundedBuffer) -> R) -> Result<R> {
        self.buffer
            .as_mut()
            .map(f)
            .ok_or(Error::NotReady("file source is not open"))
    }

    fn close(&mut self) {
        self.file = None;
        self.buffer = None;
        self.eof = false;
    }
}
