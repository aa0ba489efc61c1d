//! Reusable byte buffers for upstream response bodies.
//!
//! Buffers are handed out as [`PooledBuffer`] guards that return themselves to the pool
//! when dropped, so every exit path (success, error, cancelled hedge) gives the memory
//! back without explicit bookkeeping.

use parking_lot::Mutex;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Buffers larger than this are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 4 * 1024 * 1024;

const INITIAL_CAPACITY: usize = 16 * 1024;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Creates a pool retaining at most `max_pooled` idle buffers.
    #[must_use]
    pub fn new(max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Takes an empty buffer from the pool, allocating if none is idle.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.free.lock().pop().unwrap_or_else(|| Vec::with_capacity(INITIAL_CAPACITY));
        let outstanding = self.outstanding.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::record_buffer_pool_outstanding(outstanding);
        PooledBuffer { buf, pool: Arc::clone(self) }
    }

    /// Number of buffers currently checked out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        let outstanding = self.outstanding.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::record_buffer_pool_outstanding(outstanding);

        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_pooled", &self.max_pooled)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

/// A checked-out buffer. Returns to its pool on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.buf.len()).finish_non_exhaustive()
    }
}
