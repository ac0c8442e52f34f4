//! Lock-free single-producer/single-consumer byte ring.
//!
//! [`ring_buffer`] returns a [`Producer`] and a [`Consumer`] sharing one
//! fixed-capacity buffer. Neither half can be cloned and every mutating call
//! takes `&mut self`, so at most one thread writes and at most one thread
//! reads. There is no lock: the producer publishes bytes with a release store
//! of the write cursor, the consumer frees space with a release store of the
//! read cursor.
//!
//! Cursors count bytes ever written/read and only wrap at `usize::MAX`; the
//! physical slot is `cursor % capacity`. The number of unread bytes is
//! `write - read` (wrapping), which always stays within `0..=capacity`.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
use std::sync::atomic::AtomicBool;

struct Ring {
    slots: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    read: AtomicUsize,
    write: AtomicUsize,
    #[cfg(debug_assertions)]
    producer_busy: AtomicBool,
    #[cfg(debug_assertions)]
    consumer_busy: AtomicBool,
}

// SAFETY: the producer only writes slots in the free region
// `[write, read + capacity)` and the consumer only reads slots in the filled
// region `[read, write)`. The two regions never overlap, and ownership of a
// slot moves between sides only through the release/acquire cursor stores.
unsafe impl Send for Ring {}
// SAFETY: see above.
unsafe impl Sync for Ring {}

impl Ring {
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.slots.as_ptr())
    }

    fn used(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Copy `src` into the slots starting at `cursor`, wrapping at the end.
    ///
    /// # Safety
    ///
    /// `src.len()` bytes starting at `cursor` must lie in the producer's free region.
    unsafe fn copy_in(&self, cursor: usize, src: &[u8]) {
        let start = cursor % self.capacity;
        let first = src.len().min(self.capacity - start);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(start), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), self.base(), src.len() - first);
        }
    }

    /// Copy slots starting at `cursor` into `dst`, wrapping at the end.
    ///
    /// # Safety
    ///
    /// `dst.len()` bytes starting at `cursor` must lie in the consumer's filled region.
    unsafe fn copy_out(&self, cursor: usize, dst: &mut [u8]) {
        let start = cursor % self.capacity;
        let first = dst.len().min(self.capacity - start);
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(start), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(
                self.base(),
                dst.as_mut_ptr().add(first),
                dst.len() - first,
            );
        }
    }
}

/// Debug-build tripwire that panics if one side of the ring is entered from
/// two threads at once.
#[cfg(debug_assertions)]
struct SideGuard<'a>(&'a AtomicBool);

#[cfg(debug_assertions)]
impl<'a> SideGuard<'a> {
    fn enter(flag: &'a AtomicBool, side: &str) -> Self {
        assert!(
            !flag.swap(true, Ordering::Acquire),
            "ring buffer {side} entered concurrently from two threads"
        );
        Self(flag)
    }
}

#[cfg(debug_assertions)]
impl Drop for SideGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

macro_rules! guard_side {
    ($flag:expr, $side:literal) => {
        #[cfg(debug_assertions)]
        let _guard = SideGuard::enter(&$flag, $side);
    };
}

/// Create a ring of `capacity` bytes and split it into its two halves.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn ring_buffer(capacity: usize) -> (Producer, Consumer) {
    assert!(capacity > 0, "ring buffer capacity must be non-zero");
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(0u8))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        slots,
        capacity,
        read: AtomicUsize::new(0),
        write: AtomicUsize::new(0),
        #[cfg(debug_assertions)]
        producer_busy: AtomicBool::new(false),
        #[cfg(debug_assertions)]
        consumer_busy: AtomicBool::new(false),
    });
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

/// Writing half of a ring buffer. Exactly one may exist per ring.
pub struct Producer {
    ring: Arc<Ring>,
}

impl Producer {
    /// Append all of `data`, or nothing.
    ///
    /// Returns `false` when fewer than `data.len()` bytes are free; the caller
    /// retries later. Bytes become visible to the consumer on success.
    pub fn try_write(&mut self, data: &[u8]) -> bool {
        guard_side!(self.ring.producer_busy, "producer");
        let ring = &*self.ring;
        let write = ring.write.load(Ordering::Relaxed);
        let read = ring.read.load(Ordering::Acquire);
        let free = ring.capacity - write.wrapping_sub(read);
        if data.len() > free {
            return false;
        }
        // SAFETY: `data.len() <= free`, so the range is inside the free region.
        unsafe { ring.copy_in(write, data) };
        ring.write
            .store(write.wrapping_add(data.len()), Ordering::Release);
        true
    }

    /// Unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.ring.used()
    }

    /// Whether no unread bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can be written right now.
    pub fn free_space(&self) -> usize {
        self.ring.capacity - self.len()
    }

    /// Whether fewer than `margin` bytes (at least one) are free.
    pub fn is_full(&self, margin: usize) -> bool {
        self.free_space() < margin.max(1)
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }
}

/// Reading half of a ring buffer. Exactly one may exist per ring.
pub struct Consumer {
    ring: Arc<Ring>,
}

impl Consumer {
    /// Copy the next `out.len()` bytes into `out` and consume them.
    ///
    /// Returns `false`, consuming nothing, when fewer bytes are buffered.
    pub fn try_read(&mut self, out: &mut [u8]) -> bool {
        guard_side!(self.ring.consumer_busy, "consumer");
        let Some(read) = self.readable(out.len()) else {
            return false;
        };
        // SAFETY: `readable` checked that `out.len()` bytes are filled.
        unsafe { self.ring.copy_out(read, out) };
        self.ring
            .read
            .store(read.wrapping_add(out.len()), Ordering::Release);
        true
    }

    /// Copy the next `out.len()` bytes into `out` without consuming them.
    ///
    /// Pair with [`advance_read`](Self::advance_read) once the bytes are handled.
    pub fn try_peek(&mut self, out: &mut [u8]) -> bool {
        guard_side!(self.ring.consumer_busy, "consumer");
        let Some(read) = self.readable(out.len()) else {
            return false;
        };
        // SAFETY: `readable` checked that `out.len()` bytes are filled.
        unsafe { self.ring.copy_out(read, out) };
        true
    }

    /// Consume `count` bytes without copying them.
    ///
    /// Returns `false`, consuming nothing, when fewer bytes are buffered.
    pub fn advance_read(&mut self, count: usize) -> bool {
        guard_side!(self.ring.consumer_busy, "consumer");
        let Some(read) = self.readable(count) else {
            return false;
        };
        self.ring
            .read
            .store(read.wrapping_add(count), Ordering::Release);
        true
    }

    /// Discard every byte buffered so far.
    pub fn clear(&mut self) {
        guard_side!(self.ring.consumer_busy, "consumer");
        let write = self.ring.write.load(Ordering::Acquire);
        self.ring.read.store(write, Ordering::Release);
    }

    /// Read cursor if at least `count` bytes are buffered.
    fn readable(&self, count: usize) -> Option<usize> {
        let read = self.ring.read.load(Ordering::Relaxed);
        let write = self.ring.write.load(Ordering::Acquire);
        (write.wrapping_sub(read) >= count).then_some(read)
    }

    /// Unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.ring.used()
    }

    /// Whether no unread bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the producer could write right now.
    pub fn free_space(&self) -> usize {
        self.ring.capacity - self.len()
    }

    /// Whether fewer than `margin` bytes (at least one) are free.
    pub fn is_full(&self, margin: usize) -> bool {
        self.free_space() < margin.max(1)
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
