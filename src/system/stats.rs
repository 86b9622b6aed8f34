//! Point-in-time memory statistics
//!
//! [`capture`] builds a [`MemorySnapshot`] from three sources: jemalloc's
//! statistics (refreshed by advancing the stats epoch), the counting
//! allocator's malloc/free tallies, and the reclamation bookkeeping kept here.
//!
//! jemalloc has no garbage collector. Its closest equivalent is a purge, which
//! returns dirty pages to the OS. Purges forced by this agent (heap dumps) are
//! counted as forced cycles and timed as pauses; jemalloc's own decay sweeps
//! are added to the cycle count.

use crate::core::allocator;
use crate::system::process;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::ffi::{c_char, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

// MALLCTL_ARENAS_ALL is arena index 4096 in jemalloc 5
const PURGE_ALL_ARENAS: &[u8] = b"arena.4096.purge\0";
const TCACHE_BYTES: &[u8] = b"stats.arenas.4096.tcache_bytes\0";
const DIRTY_NPURGE: &[u8] = b"stats.arenas.4096.dirty_npurge\0";
const MUZZY_NPURGE: &[u8] = b"stats.arenas.4096.muzzy_npurge\0";
const PAGES_DIRTY: &[u8] = b"stats.arenas.4096.pdirty\0";
const PAGE_SIZE: &[u8] = b"arenas.page\0";

static STARTED: Lazy<Instant> = Lazy::new(Instant::now);
static FORCED_RECLAIMS: AtomicU32 = AtomicU32::new(0);
static LAST_RECLAIM_NS: AtomicU64 = AtomicU64::new(0);
static PAUSE_TOTAL_NS: AtomicU64 = AtomicU64::new(0);

/// Field names of the serialized snapshot, in declaration order
pub const FIELD_NAMES: [&str; 27] = [
    "Alloc", "TotalAlloc", "Sys", "Lookups", "Mallocs", "Frees",
    "HeapAlloc", "HeapSys", "HeapIdle", "HeapInuse", "HeapReleased", "HeapObjects",
    "StackInuse", "StackSys", "MSpanInuse", "MSpanSys", "MCacheInuse", "MCacheSys",
    "BuckHashSys", "GCSys", "OtherSys", "NextGC", "LastGC", "PauseTotalNs",
    "NumGC", "NumForcedGC", "GCCPUFraction",
];

/// One immutable capture of memory and reclamation counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemorySnapshot {
    /// Bytes of allocated heap objects
    pub alloc: u64,
    /// Cumulative bytes allocated since process start
    pub total_alloc: u64,
    /// Total bytes obtained from the OS, the sum of the `*Sys` fields
    pub sys: u64,
    /// Pointer lookups; always 0
    pub lookups: u64,
    /// Cumulative count of heap objects allocated
    pub mallocs: u64,
    /// Cumulative count of heap objects freed
    pub frees: u64,
    /// Same as `alloc`
    pub heap_alloc: u64,
    /// Bytes in extents mapped by the allocator
    pub heap_sys: u64,
    /// Mapped bytes not backing active pages
    pub heap_idle: u64,
    /// Bytes in active pages
    pub heap_inuse: u64,
    /// Bytes unmapped but retained for reuse
    pub heap_released: u64,
    /// Live heap objects
    pub heap_objects: u64,
    /// Bytes of the main thread stack
    pub stack_inuse: u64,
    /// Bytes of stack memory obtained from the OS
    pub stack_sys: u64,
    /// Allocator metadata in use
    #[serde(rename = "MSpanInuse")]
    pub mspan_inuse: u64,
    /// Allocator metadata obtained from the OS
    #[serde(rename = "MSpanSys")]
    pub mspan_sys: u64,
    /// Bytes cached in thread caches
    #[serde(rename = "MCacheInuse")]
    pub mcache_inuse: u64,
    /// Bytes of thread caches obtained from the OS
    #[serde(rename = "MCacheSys")]
    pub mcache_sys: u64,
    /// Profiling bucket table; 0 because allocation sampling is off
    pub buck_hash_sys: u64,
    /// Reclamation metadata; 0, jemalloc keeps none outside its metadata
    #[serde(rename = "GCSys")]
    pub gc_sys: u64,
    /// Resident bytes not accounted for by the other `*Sys` fields
    pub other_sys: u64,
    /// Dirty bytes the next purge would return to the OS
    #[serde(rename = "NextGC")]
    pub next_gc: u64,
    /// Unix time in nanoseconds of the last forced purge, 0 if none
    #[serde(rename = "LastGC")]
    pub last_gc: u64,
    /// Cumulative nanoseconds spent in forced purges
    pub pause_total_ns: u64,
    /// Purge cycles, background sweeps plus forced purges
    #[serde(rename = "NumGC")]
    pub num_gc: u32,
    /// Purge cycles forced by the agent
    #[serde(rename = "NumForcedGC")]
    pub num_forced_gc: u32,
    /// Fraction of uptime spent in forced purges, in [0, 1]
    #[serde(rename = "GCCPUFraction")]
    pub gc_cpu_fraction: f64,
}

/// Raw jemalloc counters for one stats epoch
#[derive(Debug, Default, Clone, Copy)]
struct AllocatorStats {
    allocated: u64,
    active: u64,
    metadata: u64,
    resident: u64,
    mapped: u64,
    retained: u64,
    tcache_bytes: u64,
    purge_sweeps: u64,
    dirty_bytes: u64,
}

impl AllocatorStats {
    // Unreadable counters report 0; the snapshot stays structurally valid
    fn read() -> Self {
        if let Err(e) = tikv_jemalloc_ctl::epoch::advance() {
            warn!(error = %e, "could not refresh allocator statistics");
        }

        let page_size = unsafe { read_ctl::<usize>(PAGE_SIZE) };
        let pages_dirty = unsafe { read_ctl::<usize>(PAGES_DIRTY) };

        Self {
            allocated: tikv_jemalloc_ctl::stats::allocated::read().unwrap_or(0) as u64,
            active: tikv_jemalloc_ctl::stats::active::read().unwrap_or(0) as u64,
            metadata: tikv_jemalloc_ctl::stats::metadata::read().unwrap_or(0) as u64,
            resident: tikv_jemalloc_ctl::stats::resident::read().unwrap_or(0) as u64,
            mapped: tikv_jemalloc_ctl::stats::mapped::read().unwrap_or(0) as u64,
            retained: tikv_jemalloc_ctl::stats::retained::read().unwrap_or(0) as u64,
            tcache_bytes: unsafe { read_ctl::<usize>(TCACHE_BYTES) } as u64,
            purge_sweeps: unsafe { read_ctl::<u64>(DIRTY_NPURGE) }
                .saturating_add(unsafe { read_ctl::<u64>(MUZZY_NPURGE) }),
            dirty_bytes: (pages_dirty as u64).saturating_mul(page_size as u64),
        }
    }
}

/// Read a numeric mallctl value, 0 when the name is unknown to this build
///
/// # Safety
/// `name` must be NUL terminated and `T` must match the control's C type.
unsafe fn read_ctl<T: Copy + Default>(name: &[u8]) -> T {
    tikv_jemalloc_ctl::raw::read::<T>(name).unwrap_or_default()
}

/// Capture the current memory statistics
///
/// Never fails and may be called concurrently from any thread.
pub fn capture() -> MemorySnapshot {
    let jemalloc = AllocatorStats::read();
    let counts = allocator::allocation_counts();
    let stack = process::stack_bytes();

    let heap_sys = jemalloc.mapped;
    let heap_inuse = jemalloc.active.min(heap_sys);
    let heap_idle = heap_sys - heap_inuse;

    let mspan = jemalloc.metadata;
    let mcache = jemalloc.tcache_bytes;
    let other_sys = jemalloc.resident.saturating_sub(heap_sys + mspan);
    let sys = heap_sys + stack + mspan + mcache + other_sys;

    let forced = FORCED_RECLAIMS.load(Ordering::Relaxed);
    let pause_total_ns = PAUSE_TOTAL_NS.load(Ordering::Relaxed);
    let sweeps = u32::try_from(jemalloc.purge_sweeps).unwrap_or(u32::MAX);

    MemorySnapshot {
        alloc: jemalloc.allocated,
        total_alloc: counts.total_alloc,
        sys,
        lookups: 0,
        mallocs: counts.mallocs,
        frees: counts.frees,
        heap_alloc: jemalloc.allocated,
        heap_sys,
        heap_idle,
        heap_inuse,
        heap_released: jemalloc.retained,
        heap_objects: counts.live_objects(),
        stack_inuse: stack,
        stack_sys: stack,
        mspan_inuse: mspan,
        mspan_sys: mspan,
        mcache_inuse: mcache,
        mcache_sys: mcache,
        buck_hash_sys: 0,
        gc_sys: 0,
        other_sys,
        next_gc: jemalloc.dirty_bytes,
        last_gc: LAST_RECLAIM_NS.load(Ordering::Relaxed),
        pause_total_ns,
        num_gc: sweeps.saturating_add(forced),
        num_forced_gc: forced,
        gc_cpu_fraction: pause_fraction(pause_total_ns, STARTED.elapsed()),
    }
}

/// Start the uptime clock used for `GCCPUFraction`
pub fn init() {
    Lazy::force(&STARTED);
}

/// Purge every arena, returning unused dirty pages to the OS
///
/// Recorded as a forced cycle; returns the time the purge took.
pub fn force_reclaim() -> Duration {
    let start = Instant::now();
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            PURGE_ALL_ARENAS.as_ptr() as *const c_char,
            ptr::null_mut::<c_void>(),
            ptr::null_mut(),
            ptr::null_mut::<c_void>(),
            0,
        )
    };
    let pause = start.elapsed();
    if rc != 0 {
        warn!(code = rc, "allocator purge failed");
    }

    record_forced_reclaim(pause);
    pause
}

fn record_forced_reclaim(pause: Duration) {
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    PAUSE_TOTAL_NS.fetch_add(pause.as_nanos() as u64, Ordering::Relaxed);
    LAST_RECLAIM_NS.store(now_ns, Ordering::Relaxed);
    FORCED_RECLAIMS.fetch_add(1, Ordering::Relaxed);
}

fn pause_fraction(pause_total_ns: u64, uptime: Duration) -> f64 {
    let uptime_ns = uptime.as_nanos() as f64;
    if uptime_ns <= 0.0 {
        return 0.0;
    }
    (pause_total_ns as f64 / uptime_ns).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_heap_accounting_consistent() {
        for _ in 0..2 {
            let s = capture();
            assert_eq!(s.heap_inuse + s.heap_idle, s.heap_sys);
            assert_eq!(
                s.sys,
                s.heap_sys + s.stack_sys + s.mspan_sys + s.mcache_sys
                    + s.buck_hash_sys + s.gc_sys + s.other_sys
            );
            assert_eq!(s.heap_alloc, s.alloc);
            assert_eq!(s.heap_objects, s.mallocs.saturating_sub(s.frees));
            assert!((0.0..=1.0).contains(&s.gc_cpu_fraction));
        }
    }

    #[test]
    fn test_allocations_visible_in_snapshot() {
        let before = capture();
        let block = vec![7u8; 4 << 20];
        let after = capture();

        assert!(after.alloc >= before.alloc + block.len() as u64 / 2);
        assert!(after.total_alloc > before.total_alloc);
        assert!(after.mallocs > before.mallocs);
        drop(block);
    }

    #[test]
    fn test_forced_reclaim_recorded() {
        let before = capture();
        force_reclaim();
        let after = capture();

        assert!(after.num_forced_gc > before.num_forced_gc);
        assert!(after.num_gc >= after.num_forced_gc);
        assert!(after.last_gc > 0);
        assert!(after.pause_total_ns >= before.pause_total_ns);
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(capture()).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), FIELD_NAMES.len());
        for name in FIELD_NAMES {
            assert!(object.contains_key(name), "missing field {}", name);
        }
    }

    #[test]
    fn test_pause_fraction_bounds() {
        assert_eq!(pause_fraction(0, Duration::ZERO), 0.0);
        assert_eq!(pause_fraction(5, Duration::from_nanos(1)), 1.0);
        assert!((pause_fraction(250, Duration::from_nanos(1000)) - 0.25).abs() < 1e-9);
    }
}
