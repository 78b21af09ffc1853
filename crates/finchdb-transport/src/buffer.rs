//! Power-of-two pooled buffer allocator.
//!
//! Buffers are cached in size-class buckets keyed by capacity rounded up to
//! the next power of two. Requests outside the configured capacity range
//! bypass the pool entirely. A background task evicts buffers that have sat
//! idle past a threshold, so peak memory after a traffic burst is bounded.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Smallest pooled capacity. Requests that round up below this allocate
    /// directly and are never returned to the pool. Must be a power of two.
    pub min_pooled_capacity: usize,
    /// Largest pooled capacity. Must be a power of two.
    pub max_pooled_capacity: usize,
    /// How long a buffer may sit idle in its bucket before the pruner evicts
    /// it. The pruner scans at half this interval.
    pub max_idle_time: Duration,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            min_pooled_capacity: 8 * 1024,
            max_pooled_capacity: 16 * 1024 * 1024,
            max_idle_time: Duration::from_secs(60),
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    /// Buffers currently idle across all buckets.
    pub idle_buffers: usize,
    /// Total capacity of idle buffers, in bytes.
    pub idle_bytes: usize,
    /// Buffers currently checked out.
    pub outstanding: usize,
}

struct IdleBuffer {
    buf: Vec<u8>,
    released_at: Instant,
}

/// A size-classed cache of reusable byte buffers.
pub struct BufferPool {
    config: BufferPoolConfig,
    /// One idle stack per power-of-two class, smallest class first.
    buckets: Vec<Mutex<Vec<IdleBuffer>>>,
    min_class: u32,
    outstanding: AtomicUsize,
    pruner: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BufferPool {
    /// Creates a pool with the given configuration.
    ///
    /// The pruner is not started; call [`BufferPool::start_pruner`] once a
    /// runtime is available.
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        let min = config.min_pooled_capacity.next_power_of_two();
        let max = config.max_pooled_capacity.next_power_of_two().max(min);
        let min_class = min.trailing_zeros();
        let max_class = max.trailing_zeros();
        let buckets = (min_class..=max_class).map(|_| Mutex::new(Vec::new())).collect();
        Arc::new(Self {
            config: BufferPoolConfig {
                min_pooled_capacity: min,
                max_pooled_capacity: max,
                ..config
            },
            buckets,
            min_class,
            outstanding: AtomicUsize::new(0),
            pruner: Mutex::new(None),
        })
    }

    /// Creates a pool with default configuration.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(BufferPoolConfig::default())
    }

    /// Checks out a buffer with capacity of at least `size` bytes.
    ///
    /// The buffer's length is `size` and its contents are zeroed, so no bytes
    /// from a previous tenant are ever observable. Dropping the returned
    /// handle releases the buffer back to its bucket.
    pub fn acquire(self: &Arc<Self>, size: usize) -> PooledBuffer {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        match self.bucket_index(size) {
            Some(index) => {
                let class_capacity = self.class_capacity(index);
                let recycled = self.buckets[index].lock().unwrap().pop();
                let mut buf = match recycled {
                    Some(idle) => idle.buf,
                    None => Vec::with_capacity(class_capacity),
                };
                buf.clear();
                buf.resize(size, 0);
                PooledBuffer {
                    buf: Some(buf),
                    pool: Some(Arc::clone(self)),
                }
            }
            // Out of the pooled range: plain allocation, freed on drop.
            None => PooledBuffer {
                buf: Some(vec![0u8; size]),
                pool: Some(Arc::clone(self)),
            },
        }
    }

    /// Returns a raw buffer to its size-class bucket.
    ///
    /// Buffers whose capacity rounds outside the pooled range are dropped.
    fn release(&self, buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if let Some(index) = self.bucket_index(buf.capacity()) {
            self.buckets[index].lock().unwrap().push(IdleBuffer {
                buf,
                released_at: Instant::now(),
            });
        }
    }

    /// Evicts idle buffers older than the configured threshold.
    pub fn prune(&self) {
        let cutoff = self.config.max_idle_time;
        let mut evicted = 0usize;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            let before = bucket.len();
            bucket.retain(|idle| idle.released_at.elapsed() <= cutoff);
            evicted += before - bucket.len();
        }
        if evicted > 0 {
            debug!(evicted, "evicted idle buffers");
        }
    }

    /// Starts the background eviction task, rescanning at half the idle
    /// threshold. Restarting replaces any previous task.
    pub fn start_pruner(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let interval = (self.config.max_idle_time / 2).max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.prune();
            }
        });
        if let Some(previous) = self.pruner.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the pruner and drops all idle buffers. Idempotent.
    pub fn close(&self) {
        if let Some(handle) = self.pruner.lock().unwrap().take() {
            handle.abort();
        }
        for bucket in &self.buckets {
            bucket.lock().unwrap().clear();
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let mut idle_buffers = 0;
        let mut idle_bytes = 0;
        for bucket in &self.buckets {
            let bucket = bucket.lock().unwrap();
            idle_buffers += bucket.len();
            idle_bytes += bucket.iter().map(|idle| idle.buf.capacity()).sum::<usize>();
        }
        BufferPoolStats {
            idle_buffers,
            idle_bytes,
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }

    fn bucket_index(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let rounded = size.next_power_of_two();
        if rounded < self.config.min_pooled_capacity || rounded > self.config.max_pooled_capacity {
            return None;
        }
        Some((rounded.trailing_zeros() - self.min_class) as usize)
    }

    fn class_capacity(&self, index: usize) -> usize {
        1usize << (self.min_class + index as u32)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Some(handle) = self.pruner.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Dropping the handle is the single release path; there is no separate
/// reference count to reach zero first.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuffer {
    /// Length of the initialized portion.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Whether the buffer holds no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity. May exceed the requested size due to size classing,
    /// and may grow if the backing vector is extended.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(|b| b.capacity()).unwrap_or(0)
    }

    /// The initialized bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Mutable access to the backing vector, for encoders that append.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer already detached")
    }

    /// Detaches the backing vector from the pool. The bytes are no longer
    /// returned to a bucket when dropped.
    pub fn detach(mut self) -> Vec<u8> {
        self.pool = None;
        self.buf.take().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(pool) = self.pool.take() {
                pool.release(buf);
            }
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_rounds_up_to_class() {
        let pool = BufferPool::with_defaults();
        let buf = pool.acquire(20_000);
        assert_eq!(buf.len(), 20_000);
        assert_eq!(buf.capacity(), 32 * 1024);
    }

    #[test]
    fn test_release_returns_to_same_bucket() {
        let pool = BufferPool::with_defaults();
        let buf = pool.acquire(20_000);
        drop(buf);
        assert_eq!(pool.stats().idle_buffers, 1);

        // Re-acquiring the same size drains the same bucket.
        let buf = pool.acquire(20_000);
        assert_eq!(pool.stats().idle_buffers, 0);
        assert_eq!(buf.capacity(), 32 * 1024);
    }

    #[test]
    fn test_out_of_range_is_not_pooled() {
        let pool = BufferPool::with_defaults();
        let small = pool.acquire(100);
        assert_eq!(small.capacity(), 100);
        drop(small);
        let huge = pool.acquire(64 * 1024 * 1024);
        drop(huge);
        assert_eq!(pool.stats().idle_buffers, 0);
    }

    #[test]
    fn test_acquire_zeroes_previous_contents() {
        let pool = BufferPool::with_defaults();
        let mut buf = pool.acquire(8 * 1024);
        buf.as_mut_vec().fill(0xAB);
        drop(buf);

        let buf = pool.acquire(8 * 1024);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_grown_buffer_moves_bucket() {
        let pool = BufferPool::with_defaults();
        let mut buf = pool.acquire(8 * 1024);
        // Append past the class capacity; the vector reallocates.
        buf.as_mut_vec().resize(40 * 1024, 1);
        assert!(buf.capacity() > 8 * 1024);
        drop(buf);
        // It lands in the bucket matching its new capacity.
        let stats = pool.stats();
        assert_eq!(stats.idle_buffers, 1);
        assert!(stats.idle_bytes >= 40 * 1024);
    }

    #[test]
    fn test_detach_skips_release() {
        let pool = BufferPool::with_defaults();
        let buf = pool.acquire(8 * 1024);
        let raw = buf.detach();
        assert_eq!(raw.len(), 8 * 1024);
        assert_eq!(pool.stats().idle_buffers, 0);
    }

    #[test]
    fn test_prune_evicts_idle() {
        let pool = BufferPool::new(BufferPoolConfig {
            max_idle_time: Duration::from_millis(0),
            ..BufferPoolConfig::default()
        });
        drop(pool.acquire(8 * 1024));
        assert_eq!(pool.stats().idle_buffers, 1);
        std::thread::sleep(Duration::from_millis(5));
        pool.prune();
        assert_eq!(pool.stats().idle_buffers, 0);
    }

    #[tokio::test]
    async fn test_pruner_task_runs() {
        let pool = BufferPool::new(BufferPoolConfig {
            max_idle_time: Duration::from_millis(20),
            ..BufferPoolConfig::default()
        });
        drop(pool.acquire(8 * 1024));
        pool.start_pruner();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.stats().idle_buffers, 0);
        pool.close();
    }

    #[test]
    fn test_outstanding_accounting() {
        let pool = BufferPool::with_defaults();
        let a = pool.acquire(8 * 1024);
        let b = pool.acquire(1024);
        assert_eq!(pool.stats().outstanding, 2);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
