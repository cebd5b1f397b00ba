use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::error::CoreError;
use crate::invariants::{
    debug_assert_bounded_count, debug_assert_head_not_past_tail, debug_assert_initialized_read,
    debug_assert_monotonic, debug_assert_no_wrap,
};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Bounded power-of-two SPSC ring of opaque buffer handles between one capture
// (or dispatch) thread and one worker thread.
//
// Sequence numbers (`head`, `tail`) are unbounded u64 counters rather than
// wrapped indices; the slot index is `sequence & mask`, computed only when
// touching the buffer. At worker-pipeline packet rates wrap takes decades, so
// this sidesteps ABA entirely.
//
// **Producer (push_burst):**
// 1. Load `tail` (Relaxed — only the producer writes it).
// 2. Read cached `head` (`UnsafeCell`, single-writer: producer only).
// 3. If cached capacity is insufficient, Acquire-load the real `head` and
//    refresh the cache — this synchronizes with the consumer's Release store.
// 4. Write handles into slots (no ordering needed; these slots are not yet
//    visible to the consumer).
// 5. Release-store the new `tail`, publishing the writes.
//
// **Consumer (pop_burst):** the mirror image over `head`/`tail`.
//
// Any handle written to a slot before the producer's Release-store of `tail`
// is observable to a consumer that Acquire-loads `tail`; this is what lets
// handing a buffer handle off through the ring transfer exclusive ownership
// of the buffer's contents.
//
// `buffer[idx]` has exactly one writer at a time by the SPSC contract (one
// producer, one consumer, disjoint index ranges by construction), so no
// atomics guard the slots themselves.
// =============================================================================

/// Bounded power-of-two SPSC ring buffer of `T`.
///
/// One producer thread may call the push side; one consumer thread may call
/// the pop side. Mixing callers on either side is unsound.
#[repr(C)]
pub struct Ring<T> {
    // === PRODUCER HOT ===
    tail: CachePadded<AtomicU64>,
    cached_head: CachePadded<UnsafeCell<u64>>,

    // === CONSUMER HOT ===
    head: CachePadded<AtomicU64>,
    cached_tail: CachePadded<UnsafeCell<u64>>,

    closed: AtomicBool,
    capacity: usize,
    mask: usize,

    buffer: UnsafeCell<Box<[MaybeUninit<T>]>>,
}

// SAFETY: the SPSC contract (one producer, one consumer, disjoint slot
// ranges between `head` and `tail`) makes concurrent access to `buffer` and
// the cached cursors sound as long as `T: Send`.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a ring with the given power-of-two capacity.
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(CoreError::RingCapacityNotPowerOfTwo(capacity));
        }

        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, MaybeUninit::uninit);

        Ok(Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            cached_head: CachePadded::new(UnsafeCell::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            cached_tail: CachePadded::new(UnsafeCell::new(0)),
            closed: AtomicBool::new(false),
            capacity,
            mask: capacity - 1,
            buffer: UnsafeCell::new(buffer.into_boxed_slice()),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Pushes as many of `items` as fit. Returns the number actually written
    /// (0 if the ring is full). Never blocks.
    #[allow(clippy::cast_possible_truncation)]
    pub fn push_burst(&self, items: &[T]) -> usize
    where
        T: Copy,
    {
        if items.is_empty() {
            return 0;
        }

        let tail = self.tail.load(Ordering::Relaxed);

        // SAFETY: cached_head is written only by the producer (this path).
        let cached_head = unsafe { *self.cached_head.get() };
        let mut available = self.capacity - tail.wrapping_sub(cached_head) as usize;

        if available < items.len() {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: same single-writer argument; the Acquire load above
            // synchronizes with the consumer's Release store of `head`.
            unsafe {
                *self.cached_head.get() = head;
            }
            available = self.capacity - tail.wrapping_sub(head) as usize;
        }

        let n = items.len().min(available);
        if n == 0 {
            return 0;
        }

        // SAFETY: slots [tail, tail+n) are not readable by the consumer until
        // the Release-store below advances `tail`; only the producer writes
        // them.
        let buf = unsafe { &mut *self.buffer.get() };
        for (i, item) in items.iter().enumerate().take(n) {
            let idx = (tail.wrapping_add(i as u64) as usize) & self.mask;
            buf[idx] = MaybeUninit::new(*item);
        }

        let new_tail = tail.wrapping_add(n as u64);
        let head = self.head.load(Ordering::Relaxed);
        debug_assert_bounded_count!(new_tail.wrapping_sub(head) as usize, self.capacity);
        debug_assert_monotonic!("tail", tail, new_tail);
        debug_assert_no_wrap!("tail", tail, new_tail);

        self.tail.store(new_tail, Ordering::Release);
        n
    }

    /// Pushes a single item. Convenience wrapper over [`push_burst`].
    #[inline]
    pub fn push(&self, item: T) -> bool
    where
        T: Copy,
    {
        self.push_burst(std::slice::from_ref(&item)) == 1
    }

    /// Pushes with adaptive backoff (spin → yield → give up) until the ring
    /// accepts at least one item, closes, or patience runs out.
    pub fn push_burst_with_backoff(&self, items: &[T]) -> usize
    where
        T: Copy,
    {
        let mut backoff = Backoff::new();
        loop {
            let n = self.push_burst(items);
            if n > 0 || self.is_closed() || backoff.is_completed() {
                return n;
            }
            backoff.snooze();
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Pops up to `out.len()` items. Returns the number actually read (0 if
    /// the ring is empty). Never blocks.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pop_burst(&self, out: &mut [T]) -> usize
    where
        T: Copy,
    {
        if out.is_empty() {
            return 0;
        }

        let head = self.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail is written only by the consumer (this path).
        let mut cached_tail = unsafe { *self.cached_tail.get() };
        let mut avail = cached_tail.wrapping_sub(head) as usize;

        if avail == 0 {
            cached_tail = self.tail.load(Ordering::Acquire);
            // SAFETY: same single-writer argument; the Acquire load above
            // synchronizes with the producer's Release store of `tail`.
            unsafe {
                *self.cached_tail.get() = cached_tail;
            }
            avail = cached_tail.wrapping_sub(head) as usize;
            if avail == 0 {
                return 0;
            }
        }

        let n = out.len().min(avail);
        let tail = cached_tail;

        // SAFETY: slots [head, tail) were published by the producer's
        // Release-store of `tail`; the Acquire load that established `tail`
        // (directly above, or transitively via the cache) synchronizes with
        // it, so reading them here is sound.
        let buf = unsafe { &*self.buffer.get() };
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            let pos = head.wrapping_add(i as u64);
            debug_assert_initialized_read!(pos, head, tail);
            let idx = (pos as usize) & self.mask;
            // SAFETY: see above; `T: Copy` so this does not double-drop.
            *slot = unsafe { buf[idx].assume_init_read() };
        }

        let new_head = head.wrapping_add(n as u64);
        debug_assert_head_not_past_tail!(new_head, tail);
        debug_assert_monotonic!("head", head, new_head);

        self.head.store(new_head, Ordering::Release);
        n
    }

    /// Pops a single item. Convenience wrapper over [`pop_burst`].
    #[inline]
    pub fn pop(&self) -> Option<T>
    where
        T: Copy + Default,
    {
        let mut out = [T::default()];
        if self.pop_burst(&mut out) == 1 {
            Some(out[0])
        } else {
            None
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = tail.wrapping_sub(head) as usize;
        if count == 0 {
            return;
        }
        let buf = self.buffer.get_mut();
        for i in 0..count {
            let idx = (head.wrapping_add(i as u64) as usize) & self.mask;
            unsafe {
                ptr::drop_in_place(buf[idx].as_mut_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_basics_s1() {
        let ring = Ring::<u32>::new(4).unwrap();
        assert_eq!(ring.push_burst(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.push_burst(&[5]), 0);

        let mut out = [0u32; 1];
        assert_eq!(ring.pop_burst(&mut out), 1);
        assert_eq!(out[0], 1);

        assert_eq!(ring.push_burst(&[5]), 1);

        let mut drained = [0u32; 4];
        assert_eq!(ring.pop_burst(&mut drained), 4);
        assert_eq!(drained, [2, 3, 4, 5]);

        let mut empty = [0u32; 1];
        assert_eq!(ring.pop_burst(&mut empty), 0);
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(Ring::<u32>::new(3).is_err());
        assert!(Ring::<u32>::new(0).is_err());
        assert!(Ring::<u32>::new(8).is_ok());
    }

    #[test]
    fn fifo_order_preserved_across_wrap() {
        let ring = Ring::<u32>::new(4).unwrap();
        for round in 0..10 {
            assert_eq!(ring.push_burst(&[round * 4, round * 4 + 1, round * 4 + 2]), 3);
            let mut out = [0u32; 3];
            assert_eq!(ring.pop_burst(&mut out), 3);
            assert_eq!(out, [round * 4, round * 4 + 1, round * 4 + 2]);
        }
    }

    #[test]
    fn capacity_never_exceeded() {
        let ring = Ring::<u32>::new(16).unwrap();
        let items: Vec<u32> = (0..32).collect();
        let accepted = ring.push_burst(&items);
        assert_eq!(accepted, 16);
        assert!(ring.is_full());
        assert_eq!(ring.push_burst(&[999]), 0);
    }
}
