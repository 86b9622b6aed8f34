//! Profile capture and serialization
//!
//! [`ProfileDumper`] writes one profile of a given [`ProfileKind`] to a file.
//! The kinds differ in how they are captured:
//!
//! - `heap` purges the allocator first, then writes jemalloc's sampled live
//!   allocations as a gzipped pprof protobuf (Linux only).
//! - `goroutine`, `threadcreate` and `block` are named text profiles looked up
//!   in a [`ProfileRegistry`].
//! - `cpu` samples the whole process for a fixed window and writes a pprof
//!   protobuf. It is the only kind that blocks for a noticeable time.
//!
//! Dumping is synchronous; async callers run it on the blocking pool.

use crate::core::error::ProfileError;
use crate::system::{process, stats};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sampling window of a `cpu` dump
pub const CPU_PROFILE_WINDOW: Duration = Duration::from_secs(10);

/// Sampling frequency of the CPU profiler in Hz
pub const CPU_SAMPLE_FREQUENCY: i32 = 100;

// Frames from these libraries are dropped from CPU samples
const CPU_BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

/// The supported profile categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Allocator report after a forced purge
    Heap,
    /// Async task profile of the tokio runtime
    Goroutine,
    /// Sampled CPU profile
    Cpu,
    /// OS threads of the process
    #[serde(rename = "threadcreate")]
    ThreadCreate,
    /// Per-thread blocking profile
    Block,
}

impl ProfileKind {
    /// All kinds, in documentation order
    pub const ALL: [ProfileKind; 5] = [
        ProfileKind::Heap,
        ProfileKind::Goroutine,
        ProfileKind::Cpu,
        ProfileKind::ThreadCreate,
        ProfileKind::Block,
    ];

    /// Configuration name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Heap => "heap",
            ProfileKind::Goroutine => "goroutine",
            ProfileKind::Cpu => "cpu",
            ProfileKind::ThreadCreate => "threadcreate",
            ProfileKind::Block => "block",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileKind {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProfileKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProfileError::UnknownProfileKind(s.to_string()))
    }
}

/// What to dump and where, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRequest {
    /// Profile kind
    pub kind: ProfileKind,
    /// Destination file, truncated on every dump
    pub path: PathBuf,
}

impl ProfileRequest {
    /// Create a request
    pub fn new(kind: ProfileKind, path: impl Into<PathBuf>) -> Self {
        Self { kind, path: path.into() }
    }
}

/// A runtime profile that can be looked up by name and written as text
pub trait NamedProfile: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Write the current state of the profile
    fn write_to(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Named profiles available to the dumper
#[derive(Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<&'static str, Arc<dyn NamedProfile>>,
}

impl ProfileRegistry {
    /// Registry without any profile
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the task, thread and block profiles
    pub fn with_runtime_profiles() -> Self {
        let mut registry = Self::empty();
        registry.register(TaskProfile);
        registry.register(ThreadProfile);
        registry.register(BlockProfile);
        registry
    }

    /// Add or replace a profile under its own name
    pub fn register(&mut self, profile: impl NamedProfile + 'static) {
        self.profiles.insert(profile.name(), Arc::new(profile));
    }

    /// Look up a profile
    pub fn lookup(&self, name: &str) -> Option<&dyn NamedProfile> {
        self.profiles.get(name).map(|p| p.as_ref())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.profiles.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.names())
            .finish()
    }
}

/// Writes profiles to files
#[derive(Debug, Clone)]
pub struct ProfileDumper {
    registry: ProfileRegistry,
    cpu_window: Duration,
    cpu_frequency: i32,
}

impl Default for ProfileDumper {
    fn default() -> Self {
        Self::new(ProfileRegistry::with_runtime_profiles())
    }
}

impl ProfileDumper {
    /// Dumper over the given registry with the default CPU window
    pub fn new(registry: ProfileRegistry) -> Self {
        Self {
            registry,
            cpu_window: CPU_PROFILE_WINDOW,
            cpu_frequency: CPU_SAMPLE_FREQUENCY,
        }
    }

    /// Override the CPU sampling window
    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    /// Current CPU sampling window
    pub fn cpu_window(&self) -> Duration {
        self.cpu_window
    }

    /// Write a profile of `kind` to `path`, truncating any previous content
    ///
    /// Blocks the calling thread for the CPU window when `kind` is `cpu`.
    pub fn dump(&self, kind: ProfileKind, path: &Path) -> Result<(), ProfileError> {
        let file = File::create(path)?;
        self.write_profile(kind, file)
    }

    /// Like [`dump`](Self::dump) with the kind given by name
    ///
    /// The file is created before the name is checked, so an unknown name
    /// leaves an empty file behind.
    pub fn dump_named(&self, name: &str, path: &Path) -> Result<(), ProfileError> {
        let file = File::create(path)?;
        let kind = name.parse::<ProfileKind>()?;
        self.write_profile(kind, file)
    }

    fn write_profile(&self, kind: ProfileKind, file: File) -> Result<(), ProfileError> {
        let mut out = BufWriter::new(file);
        match kind {
            ProfileKind::Heap => {
                let pause = stats::force_reclaim();
                debug!(?pause, "forced allocator purge before heap profile");
                out.write_all(&heap_profile()?)?;
            }
            ProfileKind::Goroutine | ProfileKind::ThreadCreate | ProfileKind::Block => {
                let profile = self
                    .registry
                    .lookup(kind.as_str())
                    .ok_or_else(|| ProfileError::ProfileNotFound(kind.to_string()))?;
                profile.write_to(&mut out)?;
            }
            ProfileKind::Cpu => {
                out.write_all(&self.cpu_profile()?)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    // Sampling stops when the guard is dropped at the end of this function
    fn cpu_profile(&self) -> Result<Vec<u8>, ProfileError> {
        use pprof::protos::Message;

        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(self.cpu_frequency)
            .blocklist(CPU_BLOCKLIST)
            .build()?;

        std::thread::sleep(self.cpu_window);

        let profile = guard.report().build()?.pprof()?;
        let mut content = Vec::new();
        profile
            .encode(&mut content)
            .map_err(|e| ProfileError::Cpu(e.to_string()))?;
        Ok(content)
    }
}

/// Sampled live allocations, gzipped pprof
#[cfg(target_os = "linux")]
fn heap_profile() -> Result<Vec<u8>, ProfileError> {
    // Referencing the startup options keeps them linked in
    std::hint::black_box(crate::malloc_conf);

    let prof_ctl = jemalloc_pprof::PROF_CTL
        .as_ref()
        .ok_or(ProfileError::HeapProfilingInactive)?;
    let mut prof_ctl = prof_ctl.blocking_lock();
    if !prof_ctl.activated() {
        return Err(ProfileError::HeapProfilingInactive);
    }

    prof_ctl.dump_pprof().map_err(|e| ProfileError::Heap(e.to_string()))
}

#[cfg(not(target_os = "linux"))]
fn heap_profile() -> Result<Vec<u8>, ProfileError> {
    Err(ProfileError::Heap("heap profiles are only supported on Linux".to_string()))
}

/// Async task profile of the tokio runtime the dumper runs in
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskProfile;

impl NamedProfile for TaskProfile {
    fn name(&self) -> &'static str {
        ProfileKind::Goroutine.as_str()
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            writeln!(out, "goroutine profile: no tokio runtime on this thread")?;
            return Ok(());
        };

        let metrics = handle.metrics();
        writeln!(out, "goroutine profile: total {}", metrics.num_alive_tasks())?;
        writeln!(out, "runtime flavor: {:?}", handle.runtime_flavor())?;
        writeln!(out, "workers: {}", metrics.num_workers())?;
        writeln!(out, "global queue depth: {}", metrics.global_queue_depth())?;
        Ok(())
    }
}

/// OS threads of the process
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadProfile;

impl NamedProfile for ThreadProfile {
    fn name(&self) -> &'static str {
        ProfileKind::ThreadCreate.as_str()
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        let threads = match process::threads() {
            Ok(threads) => threads,
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                writeln!(out, "threadcreate profile: {}", e)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        writeln!(out, "threadcreate profile: total {}", threads.len())?;
        for thread in &threads {
            writeln!(out, "{} @ {} [{}]", thread.tid, thread.name, thread.state)?;
        }
        Ok(())
    }
}

/// Blocking profile: how often and how long each thread stopped running
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockProfile;

impl NamedProfile for BlockProfile {
    fn name(&self) -> &'static str {
        ProfileKind::Block.as_str()
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        let threads = match process::threads() {
            Ok(threads) => threads,
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                writeln!(out, "--- contention:\n# {}", e)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        writeln!(out, "--- contention:")?;
        writeln!(out, "cycles/second=1000000000")?;
        writeln!(out, "# wait_ns voluntary involuntary @ tid name")?;
        for t in &threads {
            writeln!(
                out,
                "{} {} {} @ {} {}",
                t.wait_ns, t.voluntary_switches, t.involuntary_switches, t.tid, t.name
            )?;
        }
        Ok(())
    }
}
