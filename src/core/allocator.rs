//! Allocation accounting for the process-wide allocator
//!
//! jemalloc reports live and mapped bytes but not how many allocations the
//! program has made. `CountingAllocator` wraps the real allocator and keeps
//! cumulative malloc/free/byte tallies in relaxed atomics.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

static MALLOCS: AtomicU64 = AtomicU64::new(0);
static FREES: AtomicU64 = AtomicU64::new(0);
static TOTAL_ALLOC: AtomicU64 = AtomicU64::new(0);

/// Global allocator wrapper counting allocations made through `inner`
pub struct CountingAllocator<A> {
    inner: A,
}

impl<A> CountingAllocator<A> {
    /// Wrap an allocator
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

/// Cumulative allocation counters since process start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationCounts {
    /// Number of heap objects allocated
    pub mallocs: u64,
    /// Number of heap objects freed
    pub frees: u64,
    /// Cumulative bytes allocated, never decreases
    pub total_alloc: u64,
}

impl AllocationCounts {
    /// Live objects: allocations not yet freed
    pub fn live_objects(&self) -> u64 {
        self.mallocs.saturating_sub(self.frees)
    }
}

/// Read the current counters
///
/// Frees are loaded before mallocs so a concurrent allocate/free pair can
/// never make `frees` exceed `mallocs` in the returned value.
pub fn allocation_counts() -> AllocationCounts {
    let frees = FREES.load(Ordering::Relaxed);
    let total_alloc = TOTAL_ALLOC.load(Ordering::Relaxed);
    let mallocs = MALLOCS.load(Ordering::Relaxed);
    AllocationCounts {
        mallocs,
        frees,
        total_alloc,
    }
}

#[inline]
fn note_alloc(size: usize) {
    MALLOCS.fetch_add(1, Ordering::Relaxed);
    TOTAL_ALLOC.fetch_add(size as u64, Ordering::Relaxed);
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            note_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            note_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout);
        FREES.fetch_add(1, Ordering::Relaxed);
    }

    // A successful realloc counts as one free and one fresh allocation
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            FREES.fetch_add(1, Ordering::Relaxed);
            note_alloc(new_size);
        }
        new_ptr
    }
}
