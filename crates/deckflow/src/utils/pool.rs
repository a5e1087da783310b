//! Fixed-size byte buffer pooling for streaming I/O.
//!
//! Copy and compression loops borrow a buffer per file instead of allocating one, and give it
//! back when done. Buffers whose length differs from the pool's buffer size are never pooled,
//! and the pool never holds more than `max_pool_size` idle buffers.
//!
//! Buffers can be handled explicitly with [`BufferPool::get`] / [`BufferPool::release`], or
//! through the RAII guard returned by [`BufferPool::acquire`].
//!
//! # Thread Safety
//!
//! `BufferPool` is `Clone + Send + Sync`; clones share the same idle buffers.
//!
//! # Example
//!
//! ```rust
//! use deckflow::utils::pool::BufferPool;
//!
//! let pool = BufferPool::new(64 * 1024, 10);
//! {
//!     let mut buffer = pool.acquire();
//!     buffer[0] = 0xFF;
//! } // returned to the pool here
//! assert_eq!(pool.pool_size(), 1);
//! ```

use parking_lot::Mutex;
use std::sync::Arc;

#[cfg(feature = "pool-metrics")]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default buffer length (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of idle buffers kept.
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// Metrics tracking for buffer reuse.
///
/// Only available when the `pool-metrics` feature is enabled.
#[cfg(feature = "pool-metrics")]
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Total number of `get`/`acquire` calls
    pub total_acquires: AtomicUsize,
    /// Acquires served from an idle buffer
    pub total_cache_hits: AtomicUsize,
    /// Peak number of idle buffers held
    pub peak_items_stored: AtomicUsize,
    /// Buffers dropped on release (wrong size or pool full)
    pub total_discards: AtomicUsize,
}

#[cfg(feature = "pool-metrics")]
impl PoolMetrics {
    /// Reuse rate as a percentage (0.0-100.0).
    pub fn hit_rate(&self) -> f64 {
        let acquires = self.total_acquires.load(Ordering::Relaxed);
        if acquires == 0 {
            return 0.0;
        }
        (self.total_cache_hits.load(Ordering::Relaxed) as f64 / acquires as f64) * 100.0
    }

    pub fn reset(&self) {
        self.total_acquires.store(0, Ordering::Relaxed);
        self.total_cache_hits.store(0, Ordering::Relaxed);
        self.peak_items_stored.store(0, Ordering::Relaxed);
        self.total_discards.store(0, Ordering::Relaxed);
    }
}

/// A bounded pool of equally sized, zero-initialised byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
    max_pool_size: usize,
    #[cfg(feature = "pool-metrics")]
    metrics: Arc<PoolMetrics>,
}

impl BufferPool {
    /// Create an empty pool handing out buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buffers: Arc::new(Mutex::new(Vec::with_capacity(max_pool_size))),
            buffer_size,
            max_pool_size,
            #[cfg(feature = "pool-metrics")]
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    /// Take an idle buffer, or allocate a fresh one when none is available.
    ///
    /// The returned buffer is always exactly `buffer_size` bytes long. Reused buffers keep
    /// whatever bytes the previous holder left in them.
    pub fn get(&self) -> Vec<u8> {
        #[cfg(feature = "pool-metrics")]
        self.metrics.total_acquires.fetch_add(1, Ordering::Relaxed);

        if let Some(buffer) = self.buffers.lock().pop() {
            #[cfg(feature = "pool-metrics")]
            self.metrics.total_cache_hits.fetch_add(1, Ordering::Relaxed);
            return buffer;
        }

        vec![0u8; self.buffer_size]
    }

    /// Return a buffer. Dropped instead when its length is wrong or the pool is full.
    pub fn release(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            #[cfg(feature = "pool-metrics")]
            self.metrics.total_discards.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pool_size {
            buffers.push(buffer);

            #[cfg(feature = "pool-metrics")]
            self.metrics
                .peak_items_stored
                .fetch_max(buffers.len(), Ordering::Relaxed);
        } else {
            #[cfg(feature = "pool-metrics")]
            self.metrics.total_discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Borrow a buffer that goes back to the pool when the guard is dropped.
    pub fn acquire(&self) -> PooledBuffer {
        PooledBuffer {
            buffer: Some(self.get()),
            pool: self.clone(),
        }
    }

    /// Number of idle buffers currently held.
    pub fn pool_size(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Discard every idle buffer.
    pub fn clear(&self) {
        self.buffers.lock().clear();
    }

    #[cfg(feature = "pool-metrics")]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_POOL_SIZE)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("idle", &self.pool_size())
            .finish()
    }
}

/// RAII guard that returns its buffer to the pool when dropped.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: BufferPool,
}

impl PooledBuffer {
    /// Detach the buffer from the pool; it will not be returned on drop.
    pub fn into_inner(mut self) -> Vec<u8> {
        self.buffer.take().unwrap_or_default()
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
