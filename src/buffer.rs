//! Fixed-capacity stream buffers and the memory pools they are carved from.
//!
//! A [`BoundedBuffer`] is allocated once when a source opens and reused for
//! every frame until the source closes. Its backing memory is accounted
//! against a [`MemoryPool`] through a [`PoolLease`], which returns the bytes to
//! the pool when the buffer is dropped, on every exit path.
//!
//! Buffers filled from a second execution context (the HTTP push fill) are
//! wrapped in a [`SharedBuffer`], whose lock is only ever taken with a bounded
//! wait.

use once_cell::sync::Lazy;

use std::{
    fmt,
    io::{self, Read},
    ops::Range,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, TryLockError,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{Error, Result};

/// Budget of the default fast, internal pool.
pub const INTERNAL_POOL_BUDGET: usize = 320 * 1024;

/// Budget of the default large, slower pool.
pub const EXTERNAL_POOL_BUDGET: usize = 8 * 1024 * 1024;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

static SYSTEM_POOLS: Lazy<Arc<PoolSet>> = Lazy::new(|| {
    Arc::new(PoolSet::new(vec![
        MemoryPool::new("internal", INTERNAL_POOL_BUDGET),
        MemoryPool::new("external", EXTERNAL_POOL_BUDGET),
    ]))
});

/// A named memory budget that stream buffers are leased from.
#[derive(Debug)]
pub struct MemoryPool {
    name: String,
    budget: usize,
    in_use: AtomicUsize,
}

impl MemoryPool {
    /// Create a pool with the given byte budget.
    pub fn new<S: Into<String>>(name: S, budget: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            budget,
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes currently leased out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Bytes that can still be leased.
    pub fn available(&self) -> usize {
        self.budget.saturating_sub(self.in_use())
    }

    /// Reserve `size` bytes of the budget.
    ///
    /// Returns `None` when the pool cannot cover the request.
    pub fn try_lease(self: &Arc<Self>, size: usize) -> Option<PoolLease> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(size)?;
            if next > self.budget {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(PoolLease {
            pool: Arc::clone(self),
            size,
        })
    }
}

/// RAII reservation of pool bytes.
///
/// Dropping the lease returns its bytes to the pool.
pub struct PoolLease {
    pool: Arc<MemoryPool>,
    size: usize,
}

impl PoolLease {
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("pool", &self.pool.name())
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Memory pools tried in preference order when a source opens.
#[derive(Debug)]
pub struct PoolSet {
    pools: Vec<Arc<MemoryPool>>,
}

impl PoolSet {
    /// Create a pool set. The first pool is preferred.
    pub fn new(pools: Vec<Arc<MemoryPool>>) -> Self {
        Self { pools }
    }

    /// The process-wide default pools: the fast internal pool, then the large
    /// external one.
    pub fn system() -> Arc<PoolSet> {
        Arc::clone(&SYSTEM_POOLS)
    }

    pub fn pools(&self) -> &[Arc<MemoryPool>] {
        &self.pools
    }

    /// Allocate a stream buffer of up to `target` bytes and at least `minimum`.
    ///
    /// The first pool that can hold the whole target wins. When none can,
    /// pools are tried again in order and the target is clamped to what each
    /// has available; a pool below `minimum`, or whose allocation fails, falls
    /// through to the next one.
    pub fn allocate(&self, target: usize, minimum: usize) -> Result<BoundedBuffer> {
        let target = target.max(minimum);

        for whole in [true, false] {
            for pool in &self.pools {
                let size = target.min(pool.available());
                if whole && size < target {
                    continue;
                }
                if size < minimum || size == 0 {
                    log::debug!(
                        "Pool '{}' has {} bytes available, below the {} byte minimum",
                        pool.name(),
                        pool.available(),
                        minimum
                    );
                    continue;
                }
                if let Some(buffer) = allocate_from(pool, size) {
                    return Ok(buffer);
                }
            }
        }

        Err(Error::AllocationFailed {
            requested: target,
            minimum,
        })
    }
}

fn allocate_from(pool: &Arc<MemoryPool>, size: usize) -> Option<BoundedBuffer> {
    let lease = pool.try_lease(size)?;

    let mut data = Vec::new();
    if data.try_reserve_exact(size).is_err() {
        log::warn!(
            "Allocating {} bytes from pool '{}' failed, trying next pool",
            size,
            pool.name()
        );
        return None;
    }
    data.resize(size, 0);

    log::debug!(
        "Allocated {} byte stream buffer from pool '{}'",
        size,
        pool.name()
    );
    Some(BoundedBuffer::from_parts(data, Some(lease)))
}

/// A fixed-capacity byte region with a write cursor (`used`) and a read cursor.
///
/// The buffer never grows. Bytes beyond the free space are refused, and the
/// caller decides whether that is a drop or back-pressure.
pub struct BoundedBuffer {
    data: Vec<u8>,
    used: usize,
    read_cursor: usize,
    payload_start: Option<usize>,
    pending_skip: usize,
    _lease: Option<PoolLease>,
}

impl BoundedBuffer {
    /// Create a buffer outside of any pool.
    pub fn new(capacity: usize) -> Self {
        Self::from_parts(vec![0; capacity], None)
    }

    fn from_parts(data: Vec<u8>, lease: Option<PoolLease>) -> Self {
        Self {
            data,
            used: 0,
            read_cursor: 0,
            payload_start: None,
            pending_skip: 0,
            _lease: lease,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes already consumed by the frame locator.
    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    /// Space left for new bytes.
    pub fn free(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn unread_len(&self) -> usize {
        self.used - self.read_cursor
    }

    /// True when no byte can be added even after compaction.
    pub fn is_stalled(&self) -> bool {
        self.free() == 0 && self.read_cursor == 0
    }

    /// All written bytes, starting at offset 0.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Written bytes that have not been consumed yet.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_cursor..self.used]
    }

    /// A written sub-range, e.g. a located frame.
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.filled()[range]
    }

    /// Bytes still to be discarded from future writes.
    pub fn pending_skip(&self) -> usize {
        self.pending_skip
    }

    /// Append bytes, honouring any pending skip.
    ///
    /// Returns the number of input bytes consumed (stored or skipped). The
    /// rest did not fit.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let skipped = bytes.len().min(self.pending_skip);
        self.pending_skip -= skipped;

        let rest = &bytes[skipped..];
        let stored = rest.len().min(self.free());
        self.data[self.used..self.used + stored].copy_from_slice(&rest[..stored]);
        self.used += stored;

        skipped + stored
    }

    /// Read once from `reader` into the free space, at most `max` bytes.
    ///
    /// Returns the raw read count; `0` means end of data (or no free space).
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let len = self.free().min(max);
        if len == 0 {
            return Ok(0);
        }

        let n = reader.read(&mut self.data[self.used..self.used + len])?;
        self.commit(n);
        Ok(n)
    }

    fn commit(&mut self, n: usize) {
        let skipped = n.min(self.pending_skip);
        if skipped > 0 {
            self.data
                .copy_within(self.used + skipped..self.used + n, self.used);
            self.pending_skip -= skipped;
        }
        self.used += n - skipped;
    }

    /// Move the read cursor to an absolute position within the written bytes.
    pub fn set_read_cursor(&mut self, position: usize) {
        self.read_cursor = position.min(self.used);
    }

    /// Discard `n` bytes starting at the read cursor, including bytes that
    /// have not arrived yet.
    pub fn skip(&mut self, n: usize) {
        let unread = self.unread_len();
        if n <= unread {
            self.read_cursor += n;
        } else {
            self.pending_skip += n - unread;
            self.read_cursor = self.used;
            // Skipped bytes never land in the buffer, so it no longer holds
            // the whole payload.
            self.payload_start = None;
        }
    }

    /// Move unread bytes to the front to make room for more.
    ///
    /// Compaction drops everything before the read cursor, including the
    /// stream header, so the buffer can no longer be rewound in place.
    pub fn compact(&mut self) {
        if self.read_cursor == 0 {
            return;
        }

        self.data.copy_within(self.read_cursor..self.used, 0);
        self.used -= self.read_cursor;
        self.read_cursor = 0;
        self.payload_start = None;
    }

    /// Record where the first frame starts and place the read cursor there.
    pub fn mark_payload_start(&mut self, offset: usize) {
        let offset = offset.min(self.used);
        self.payload_start = Some(offset);
        self.read_cursor = offset;
    }

    pub fn is_rewindable(&self) -> bool {
        self.payload_start.is_some()
    }

    /// Reset the read cursor to the first payload byte, if still buffered.
    pub fn rewind(&mut self) -> bool {
        match self.payload_start {
            Some(offset) => {
                self.read_cursor = offset;
                true
            }
            None => false,
        }
    }

    /// Forget all contents. The allocation is kept.
    pub fn clear(&mut self) {
        self.used = 0;
        self.read_cursor = 0;
        self.payload_start = None;
        self.pending_skip = 0;
    }
}

impl fmt::Debug for BoundedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedBuffer")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("read_cursor", &self.read_cursor)
            .field("payload_start", &self.payload_start)
            .field("pending_skip", &self.pending_skip)
            .field("lease", &self._lease)
            .finish()
    }
}

/// A [`BoundedBuffer`] shared between a network fill context and the tick.
///
/// The lock is only acquired with a bounded wait, and a poisoned lock is
/// recovered rather than propagated.
#[derive(Debug)]
pub struct SharedBuffer {
    inner: Mutex<BoundedBuffer>,
    dropped_bytes: AtomicU64,
}

impl SharedBuffer {
    pub fn new(buffer: BoundedBuffer) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(buffer),
            dropped_bytes: AtomicU64::new(0),
        })
    }

    /// Acquire the buffer, waiting at most `timeout`.
    pub fn lock(&self, timeout: Duration) -> Result<MutexGuard<'_, BoundedBuffer>> {
        let start = Instant::now();
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    log::warn!("Recovered stream buffer from poisoned lock");
                    return Ok(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockTimeout(timeout));
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
            }
        }
    }

    /// Bytes refused because the buffer was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Acquire)
    }
}

/// Producer handle used by push-based transports to deliver chunks.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    shared: Arc<SharedBuffer>,
    lock_timeout: Duration,
}

impl ChunkSink {
    pub fn new(shared: Arc<SharedBuffer>, lock_timeout: Duration) -> Self {
        Self {
            shared,
            lock_timeout,
        }
    }

    /// Append a received chunk.
    ///
    /// Consumed bytes are compacted away first when the chunk does not fit.
    /// Whatever still exceeds the capacity is dropped and counted.
    pub fn try_append(&self, bytes: &[u8]) -> Result<usize> {
        let mut buffer = self.shared.lock(self.lock_timeout)?;
        if buffer.free() < bytes.len() {
            buffer.compact();
        }

        let accepted = buffer.append(bytes);
        drop(buffer);

        let dropped = bytes.len() - accepted;
        if dropped > 0 {
            self.shared
                .dropped_bytes
                .fetch_add(dropped as u64, Ordering::AcqRel);
            log::warn!("Stream buffer full, dropped {} bytes", dropped);
        }
        Ok(accepted)
    }
}
