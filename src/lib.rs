//! heapwatch - in-process telemetry agent
//!
//! Periodically captures allocator statistics from the running process,
//! writes a configured profile to disk on a fixed cadence, exports a live
//! Prometheus gauge and serves a JSON statistics endpoint.
#![warn(missing_docs)]

use crate::core::allocator::CountingAllocator;

// Every allocation goes through jemalloc; the wrapper keeps malloc/free tallies
#[global_allocator]
static GLOBAL: CountingAllocator<tikv_jemallocator::Jemalloc> =
    CountingAllocator::new(tikv_jemallocator::Jemalloc);

/// jemalloc startup options: allocation sampling on, one sample per 512 KiB
#[allow(non_upper_case_globals)]
#[export_name = "_rjem_malloc_conf"]
#[used]
pub static malloc_conf: &[u8] = b"prof:true,prof_active:true,lg_prof_sample:19\0";

// Core foundational modules
pub mod core;

// Main functional modules
pub mod system;
pub mod api;

// Re-export commonly used items for convenience
pub use crate::core::{Config, Error, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
