//! Native memory allocation
//!
//! Every block the bridge hands to the native bus (payload tokens and
//! envelopes) is obtained through a [`NativeAllocator`]. The default
//! [`SystemAllocator`] uses the global allocator; [`TrackingAllocator`] wraps
//! any allocator and keeps counters so callers can check that no native memory
//! is left behind.

use serde::Serialize;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of native-addressable memory blocks
pub trait NativeAllocator: Send + Sync {
    /// Allocate a block for `layout`, or `None` if memory is exhausted
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block obtained from [`allocate`](Self::allocate)
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this allocator with the
    /// same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Allocator backed by the process global allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl NativeAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Snapshot of a [`TrackingAllocator`]'s counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocationStats {
    /// Successful allocations
    pub allocations: usize,
    /// Blocks returned
    pub deallocations: usize,
    /// Allocation requests that failed
    pub failures: usize,
    /// Blocks currently outstanding
    pub live_blocks: usize,
    /// Bytes currently outstanding
    pub live_bytes: usize,
}

/// Allocator wrapper that counts allocations and outstanding bytes
#[derive(Debug, Default)]
pub struct TrackingAllocator<A = SystemAllocator> {
    inner: A,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    failures: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl TrackingAllocator<SystemAllocator> {
    /// Track the system allocator
    pub fn new() -> Self {
        Self::wrap(SystemAllocator)
    }
}

impl<A: NativeAllocator> TrackingAllocator<A> {
    /// Track an arbitrary allocator
    pub fn wrap(inner: A) -> Self {
        Self {
            inner,
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Current counters
    pub fn stats(&self) -> AllocationStats {
        let allocations = self.allocations.load(Ordering::Acquire);
        let deallocations = self.deallocations.load(Ordering::Acquire);
        AllocationStats {
            allocations,
            deallocations,
            failures: self.failures.load(Ordering::Acquire),
            live_blocks: allocations.saturating_sub(deallocations),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
        }
    }
}

impl<A: NativeAllocator> NativeAllocator for TrackingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        match self.inner.allocate(layout) {
            Some(ptr) => {
                self.allocations.fetch_add(1, Ordering::AcqRel);
                self.live_bytes.fetch_add(layout.size(), Ordering::AcqRel);
                Some(ptr)
            }
            None => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                None
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.deallocate(ptr, layout);
        self.deallocations.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(layout.size(), Ordering::AcqRel);
    }
}

/// Allocator that succeeds a fixed number of times, then fails
#[cfg(test)]
pub(crate) struct LimitedAllocator {
    remaining: AtomicUsize,
}

#[cfg(test)]
impl LimitedAllocator {
    pub(crate) fn new(successes: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(successes),
        }
    }
}

#[cfg(test)]
impl NativeAllocator for LimitedAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let granted = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if granted {
            SystemAllocator.allocate(layout)
        } else {
            None
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        SystemAllocator.deallocate(ptr, layout)
    }
}
