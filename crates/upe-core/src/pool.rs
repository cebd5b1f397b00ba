//! Lock-free, per-thread-cached fixed-size packet buffer pool.
//!
//! # Memory ordering & synchronization strategy
//!
//! The pool's global free set is a single atomic `top` over a flat array of
//! buffer handles (`free_stack`), exactly the same CAS-stack protocol as the
//! ring's head/tail:
//!
//! - `global_pop_bulk`: acquire-load `top`; compute `actual = min(top, request)`
//!   and `new_top = top - actual`; CAS `top` from `top` to `new_top`
//!   (AcqRel on success, Acquire on failure, retried on failure); on success,
//!   copy `free_stack[new_top..top)`.
//! - `global_push_bulk`: acquire-load `top`; write the caller's handles into
//!   `free_stack[top..top+count)` *before* the CAS publishes the new `top`
//!   (these slots are invisible to poppers until the CAS succeeds); CAS `top`
//!   to `top + count`; a failed CAS means another pusher/popper moved `top`
//!   first, so the speculative writes are simply overwritten on retry.
//!
//! Only slots below `top` are the authoritative free set; writes at or past
//! `top` are private speculation until a CAS commits them (checked in debug
//! builds via `debug_assert_below_top!`).
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::buffer::{BufferHandle, PacketBuffer};
use crate::error::CoreError;
use crate::invariants::debug_assert_below_top;

/// Size of a thread-local buffer cache.
pub const LOCAL_CACHE_SIZE: usize = 64;
/// Number of handles moved between a thread cache and the global stack at a time.
pub const BULK_TRANSFER_SIZE: usize = LOCAL_CACHE_SIZE / 2;

const MAP_HUGE_SHIFT: i32 = 26;
const MAP_HUGE_2MB: i32 = 21 << MAP_HUGE_SHIFT;

enum Storage {
    /// `mmap`-backed region (huge-page or anonymous fallback).
    Mapped { ptr: *mut c_void, len: usize },
    /// Heap fallback when both mmap attempts fail.
    Heap(Box<[UnsafeCell<PacketBuffer>]>),
}

// SAFETY: buffer access is always through a handle whose exclusive ownership
// is tracked by the pool/cache protocol, never by aliasing through `Storage`
// directly.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

/// Fixed-capacity allocator of MTU-sized packet buffers.
///
/// Shared across threads behind an `Arc`; each thread pairs it with its own
/// [`PoolCache`] rather than reaching through a global thread-local, so pool
/// ownership and cache lifetime stay explicit at the call site.
pub struct BufferPool {
    capacity: usize,
    storage: Storage,
    free_stack: Box<[UnsafeCell<u32>]>,
    top: AtomicUsize,
}

// SAFETY: `free_stack` slots below `top` are read by at most one popper at a
// time (the popper that won the CAS), and slots at/above `top` are written
// only by the pusher that will next CAS `top` past them. No two threads
// observe the same slot as simultaneously readable and writable.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Allocates `capacity` buffers, attempting huge pages first.
    ///
    /// Falls back from 2 MiB huge-page `mmap` to plain anonymous `mmap` to a
    /// heap allocation, matching the three-tier fallback of the reference
    /// implementation this pool is modeled on.
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        if capacity == 0 {
            return Err(CoreError::PoolCapacityZero);
        }

        let size = capacity
            .checked_mul(std::mem::size_of::<PacketBuffer>())
            .ok_or(CoreError::PoolAllocationFailed)?;
        let storage = Self::map_region(size).unwrap_or_else(|| {
            tracing::warn!(
                capacity,
                "hugepage and anonymous mmap both failed; falling back to heap allocation"
            );
            Self::heap_region(capacity)
        });

        let mut free_stack = Vec::with_capacity(capacity);
        for i in 0..capacity {
            free_stack.push(UnsafeCell::new(i as u32));
        }

        tracing::info!(capacity, "packet buffer pool initialized");

        Ok(Self {
            capacity,
            storage,
            free_stack: free_stack.into_boxed_slice(),
            top: AtomicUsize::new(capacity),
        })
    }

    fn map_region(size: usize) -> Option<Storage> {
        // SAFETY: mmap with MAP_ANONYMOUS never reads from `fd`/`offset`; the
        // returned region is zero-filled, which matches a fresh PacketBuffer
        // (data all-zero, len 0, timestamp 0), so no further init is needed.
        unsafe {
            let huge = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | MAP_HUGE_2MB,
                -1,
                0,
            );
            if huge != libc::MAP_FAILED {
                tracing::debug!(size, "mapped packet pool on 2MiB huge pages");
                return Some(Storage::Mapped { ptr: huge, len: size });
            }

            let plain = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if plain != libc::MAP_FAILED {
                tracing::debug!(size, "mapped packet pool on anonymous pages");
                return Some(Storage::Mapped { ptr: plain, len: size });
            }
        }
        None
    }

    fn heap_region(capacity: usize) -> Storage {
        let mut v = Vec::with_capacity(capacity);
        v.resize_with(capacity, || UnsafeCell::new(PacketBuffer::new()));
        Storage::Heap(v.into_boxed_slice())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn buffer_ptr(&self, handle: BufferHandle) -> *mut PacketBuffer {
        let idx = handle.index();
        debug_assert!(idx < self.capacity, "buffer handle out of range");
        match &self.storage {
            Storage::Mapped { ptr, .. } => unsafe { (ptr.cast::<PacketBuffer>()).add(idx) },
            Storage::Heap(slice) => slice[idx].get(),
        }
    }

    /// Borrows the buffer behind `handle`.
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of `handle` per the pool's
    /// ownership protocol (allocated and not yet freed, not concurrently
    /// accessed by another party).
    #[inline]
    pub unsafe fn get(&self, handle: BufferHandle) -> &PacketBuffer {
        &*self.buffer_ptr(handle)
    }

    /// Mutably borrows the buffer behind `handle`.
    ///
    /// # Safety
    /// Same precondition as [`BufferPool::get`].
    #[inline]
    pub unsafe fn get_mut(&self, handle: BufferHandle) -> &mut PacketBuffer {
        &mut *self.buffer_ptr(handle)
    }

    fn global_pop_bulk(&self, out: &mut [BufferHandle]) -> usize {
        let request = out.len();
        let mut backoff = Backoff::new();
        loop {
            let top = self.top.load(Ordering::Acquire);
            if top == 0 {
                return 0;
            }
            let actual = request.min(top);
            let new_top = top - actual;
            if self
                .top
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                for (i, slot) in out.iter_mut().enumerate().take(actual) {
                    let idx = new_top + i;
                    debug_assert_below_top!(idx, top);
                    *slot = BufferHandle(unsafe { *self.free_stack[idx].get() });
                }
                return actual;
            }
            backoff.spin();
        }
    }

    fn global_push_bulk(&self, items: &[BufferHandle]) {
        if items.is_empty() {
            return;
        }
        let mut backoff = Backoff::new();
        loop {
            let top = self.top.load(Ordering::Acquire);
            for (i, handle) in items.iter().enumerate() {
                // SAFETY: slots [top, top+len) are private speculation until
                // the CAS below publishes the new top; a losing attempt's
                // writes are simply overwritten by the next attempt.
                unsafe {
                    *self.free_stack[top + i].get() = handle.0;
                }
            }
            if self
                .top
                .compare_exchange(
                    top,
                    top + items.len(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }
}

/// Per-thread cache of buffer handles over a shared [`BufferPool`].
///
/// Fast-path alloc/free touch only this cache; refill/flush hit the pool's
/// global CAS stack in bulk (`BULK_TRANSFER_SIZE` at a time) to amortize the
/// cost of the atomic.
pub struct PoolCache {
    pool: Arc<BufferPool>,
    items: Vec<BufferHandle>,
}

impl PoolCache {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            items: Vec::with_capacity(LOCAL_CACHE_SIZE),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Allocates a buffer handle, refilling from the global pool if the
    /// local cache is empty. Returns `None` if both are exhausted.
    pub fn alloc(&mut self) -> Option<BufferHandle> {
        if let Some(h) = self.items.pop() {
            return Some(h);
        }
        self.refill();
        self.items.pop()
    }

    /// Returns a buffer to the cache, flushing to the global pool first if
    /// the cache is full. Resets the buffer's length to zero.
    pub fn free(&mut self, handle: BufferHandle) {
        if self.items.len() >= LOCAL_CACHE_SIZE {
            self.flush();
        }
        // SAFETY: caller relinquishes exclusive ownership of `handle` by
        // calling free; no other party may hold it concurrently.
        unsafe {
            self.pool.get_mut(handle).reset();
        }
        self.items.push(handle);
    }

    fn refill(&mut self) {
        let mut buf = [BufferHandle(0); BULK_TRANSFER_SIZE];
        let n = self.pool.global_pop_bulk(&mut buf);
        self.items.extend_from_slice(&buf[..n]);
    }

    fn flush(&mut self) {
        let n = BULK_TRANSFER_SIZE.min(self.items.len());
        let start = self.items.len() - n;
        let drained: Vec<BufferHandle> = self.items.drain(start..).collect();
        self.pool.global_push_bulk(&drained);
    }

    /// Pushes every cached handle back to the global pool.
    ///
    /// Must be called (directly or via `Drop`) before the owning thread
    /// exits; a cache dropped without flushing leaks its handles permanently,
    /// and touching them afterward through a different pool is undefined,
    /// same as the pool this design is modeled on.
    pub fn flush_all(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let drained: Vec<BufferHandle> = self.items.drain(..).collect();
        self.pool.global_push_bulk(&drained);
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        self.flush_all();
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Storage::Mapped { ptr, len } = self {
            unsafe {
                libc::munmap(*ptr, *len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_alloc_exhaustion_and_recycle() {
        let pool = Arc::new(BufferPool::new(3).unwrap());
        let mut cache = PoolCache::new(pool);

        let a = cache.alloc().unwrap();
        let _b = cache.alloc().unwrap();
        let c = cache.alloc().unwrap();
        assert!(cache.alloc().is_none());

        cache.free(c);
        let recycled = cache.alloc().unwrap();
        assert_eq!(recycled, c);

        cache.free(a);
        cache.free(recycled);
    }

    #[test]
    fn pool_conservation_across_two_caches() {
        let pool = Arc::new(BufferPool::new(200).unwrap());
        let mut cache_a = PoolCache::new(Arc::clone(&pool));
        let mut cache_b = PoolCache::new(Arc::clone(&pool));

        let mut handles = Vec::new();
        for _ in 0..150 {
            handles.push(cache_a.alloc().unwrap());
        }
        for h in handles.drain(..100) {
            cache_a.free(h);
        }
        for h in handles.drain(..) {
            cache_b.free(h);
        }
        drop(cache_a);
        drop(cache_b);

        let mut recount = PoolCache::new(Arc::clone(&pool));
        let mut reclaimed = 0;
        while recount.alloc().is_some() {
            reclaimed += 1;
        }
        assert_eq!(reclaimed, 200);
    }

    #[test]
    fn buffer_fill_rejects_oversized_frame() {
        let pool = Arc::new(BufferPool::new(1).unwrap());
        let mut cache = PoolCache::new(pool);
        let h = cache.alloc().unwrap();
        unsafe {
            let buf = cache.pool().get_mut(h);
            assert!(!buf.fill(&vec![0u8; crate::buffer::BUFFER_CAPACITY + 1], 0));
            assert!(buf.fill(&[1, 2, 3], 42));
            assert_eq!(buf.as_slice(), &[1, 2, 3]);
            assert_eq!(buf.timestamp(), 42);
        }
    }
}
