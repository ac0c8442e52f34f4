//! Size-classed block pool for reusing byte buffers on the hot paths.
//!
//! Instead of allocating a fresh `Vec<u8>` for every frame, scratch read, or
//! queued payload, the [`BlockPool`] keeps free lists of blocks bucketed by a
//! canonical size. Requests are rounded up to their size class:
//!
//! ```text
//!   size            class index                     class size
//!   0..=1024        (size + 7) >> 3                 index * 8
//!   1025..=8192     (size + 127 + (120 << 7)) >> 7  (index - 120) * 128
//!   > 8192          not pooled                      exactly `size`
//! ```
//!
//! Each class has its own mutex, so the caller thread and both connection
//! workers only contend when they touch the same class at the same time.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tickwire_config::PoolConfig;

/// Largest size served by the 8-byte step classes.
pub const MAX_SMALL_BLOCK: usize = 1024;

/// Largest size that is pooled at all.
pub const MAX_POOLED_BLOCK: usize = 8 * 1024;

/// Number of size classes (indices `0..SIZE_CLASS_COUNT`).
pub const SIZE_CLASS_COUNT: usize = ((MAX_POOLED_BLOCK + 127 + (120 << 7)) >> 7) + 1;

static_assertions::const_assert_eq!(SIZE_CLASS_COUNT, 185);

/// Map a requested byte count to its size class, or `None` above [`MAX_POOLED_BLOCK`].
pub const fn size_class(size: usize) -> Option<usize> {
    if size <= MAX_SMALL_BLOCK {
        Some((size + 7) >> 3)
    } else if size <= MAX_POOLED_BLOCK {
        Some((size + 127 + (120 << 7)) >> 7)
    } else {
        None
    }
}

/// Canonical block size of a size class.
pub const fn class_size(class: usize) -> usize {
    if class <= MAX_SMALL_BLOCK >> 3 {
        class << 3
    } else {
        (class - 120) << 7
    }
}

/// A fixed-capacity byte block plus its logical length.
///
/// Obtained from [`BlockPool::acquire`] and handed back with
/// [`BlockPool::release`], which takes the buffer by value. A buffer that is
/// simply dropped is freed instead of being recycled.
///
/// The bytes of a recycled block are whatever the previous holder left there;
/// write before you read.
pub struct PooledBuffer {
    block: Box<[u8]>,
    len: usize,
}

impl PooledBuffer {
    fn new(block: Box<[u8]>, len: usize) -> Self {
        debug_assert!(len <= block.len());
        Self { block, len }
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the logical length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical capacity of the underlying block.
    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    /// The logical contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.block[..self.len]
    }

    /// The logical contents, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.block[..self.len]
    }

    /// Change the logical length.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.block.len(),
            "length {len} exceeds block capacity {}",
            self.block.len()
        );
        self.len = len;
    }

    /// Replace the contents with `data`, adjusting the logical length.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not fit the capacity.
    pub fn copy_from(&mut self, data: &[u8]) {
        self.set_len(data.len());
        self.block[..data.len()].copy_from_slice(data);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.block.len())
            .finish()
    }
}

/// Snapshot of pool activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquisitions served from a free list.
    pub hits: u64,
    /// Acquisitions that had to allocate.
    pub misses: u64,
    /// Blocks returned to a free list.
    pub recycled: u64,
    /// Released blocks that were dropped (oversized, foreign, or class full).
    pub discarded: u64,
}

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

/// Cached blocks of one size class.
type FreeList = Mutex<Vec<Box<[u8]>>>;

/// Thread-safe cache of byte blocks bucketed by size class.
///
/// Shared between the caller and the connection workers behind an `Arc`.
pub struct BlockPool {
    classes: Box<[FreeList]>,
    max_cached_per_class: usize,
    counters: PoolCounters,
}

impl BlockPool {
    /// Create an empty pool.
    pub fn new(config: &PoolConfig) -> Self {
        let classes = (0..SIZE_CLASS_COUNT)
            .map(|_| Mutex::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            classes,
            max_cached_per_class: config.max_cached_per_class,
            counters: PoolCounters::default(),
        }
    }

    /// Acquire a buffer whose logical length is `size`.
    ///
    /// Capacity is the size-class rounding of `size`, or exactly `size` when it
    /// is above [`MAX_POOLED_BLOCK`].
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        let Some(class) = size_class(size) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return PooledBuffer::new(vec![0u8; size].into_boxed_slice(), size);
        };

        if let Some(block) = self.classes[class].lock().pop() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return PooledBuffer::new(block, size);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        PooledBuffer::new(vec![0u8; class_size(class)].into_boxed_slice(), size)
    }

    /// Return a buffer to its class free list.
    ///
    /// Blocks whose capacity is not exactly a class size are dropped, as are
    /// blocks arriving at a class that already caches the configured maximum.
    pub fn release(&self, buffer: PooledBuffer) {
        let block = buffer.block;
        let capacity = block.len();

        let class = match size_class(capacity) {
            Some(class) if class_size(class) == capacity => class,
            _ => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mut free = self.classes[class].lock();
        if free.len() >= self.max_cached_per_class {
            drop(free);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        free.push(block);
        drop(free);
        self.counters.recycled.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of blocks currently cached across all classes.
    pub fn cached_blocks(&self) -> usize {
        self.classes.iter().map(|class| class.lock().len()).sum()
    }

    /// Activity counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("max_cached_per_class", &self.max_cached_per_class)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_size_class_covers_request_and_is_monotonic() {
        let mut previous = 0;
        for size in 0..=MAX_POOLED_BLOCK {
            let class = size_class(size).expect("pooled range");
            let canonical = class_size(class);
            assert!(canonical >= size, "class {class} ({canonical}) < {size}");
            assert!(canonical >= previous, "not monotonic at {size}");
            previous = canonical;
        }
    }

    #[test]
    fn test_size_class_boundaries() {
        assert_eq!(size_class(0), Some(0));
        assert_eq!(size_class(1), Some(1));
        assert_eq!(size_class(8), Some(1));
        assert_eq!(size_class(9), Some(2));
        assert_eq!(size_class(1024), Some(128));
        assert_eq!(size_class(1025), Some(129));
        assert_eq!(class_size(129), 1152);
        assert_eq!(size_class(8192), Some(184));
        assert_eq!(class_size(184), 8192);
        assert_eq!(size_class(8193), None);
    }

    #[test]
    fn test_acquire_rounds_capacity_up() {
        let pool = BlockPool::default();
        let buf = pool.acquire(13);
        assert_eq!(buf.len(), 13);
        assert_eq!(buf.capacity(), 16);

        let big = pool.acquire(1500);
        assert_eq!(big.len(), 1500);
        assert_eq!(big.capacity(), 1536);
    }

    #[test]
    fn test_zero_size_is_handled() {
        let pool = BlockPool::default();
        let buf = pool.acquire(0);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
        pool.release(buf);
        assert_eq!(pool.acquire(0).len(), 0);
    }

    #[test]
    fn test_released_block_is_reused() {
        let pool = BlockPool::default();
        let mut buf = pool.acquire(100);
        buf.copy_from(b"marker");
        pool.release(buf);
        assert_eq!(pool.cached_blocks(), 1);

        let again = pool.acquire(101);
        assert_eq!(again.capacity(), 104);
        assert_eq!(pool.cached_blocks(), 0);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_oversized_blocks_are_not_pooled() {
        let pool = BlockPool::default();
        let buf = pool.acquire(MAX_POOLED_BLOCK + 1);
        assert_eq!(buf.capacity(), MAX_POOLED_BLOCK + 1);
        pool.release(buf);
        assert_eq!(pool.cached_blocks(), 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_class_cache_cap() {
        let pool = BlockPool::new(&PoolConfig {
            max_cached_per_class: 2,
        });
        let blocks: Vec<_> = (0..4).map(|_| pool.acquire(64)).collect();
        for block in blocks {
            pool.release(block);
        }
        assert_eq!(pool.cached_blocks(), 2);
        assert_eq!(pool.stats().discarded, 2);
    }

    #[test]
    fn test_set_len_within_capacity() {
        let pool = BlockPool::default();
        let mut buf = pool.acquire(10);
        buf.set_len(16);
        assert_eq!(buf.len(), 16);
        buf.set_len(0);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "exceeds block capacity")]
    fn test_set_len_past_capacity_panics() {
        let pool = BlockPool::default();
        let mut buf = pool.acquire(10);
        buf.set_len(17);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BlockPool::default());
        std::thread::scope(|scope| {
            for t in 0..3u8 {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    for i in 0..2_000usize {
                        let size = (i * 7 + usize::from(t) * 131) % 3000;
                        let mut buf = pool.acquire(size);
                        buf.as_mut_slice().fill(t);
                        assert!(buf.iter().all(|&b| b == t));
                        pool.release(buf);
                    }
                });
            }
        });
        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 6_000);
    }
}
