//! Process introspection through procfs
//!
//! Thread listings, per-thread scheduling counters and the main stack size.
//! Everything here is Linux-only; other platforms get empty results.

use std::io;

/// One OS thread of this process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Kernel thread id
    pub tid: u32,
    /// Thread name (`comm`), truncated by the kernel to 15 bytes
    pub name: String,
    /// Scheduler state letter (R, S, D, ...)
    pub state: String,
    /// Times the thread gave up the CPU because it blocked
    pub voluntary_switches: u64,
    /// Times the thread was preempted
    pub involuntary_switches: u64,
    /// Nanoseconds spent running
    pub run_ns: u64,
    /// Nanoseconds spent runnable but waiting for a CPU
    pub wait_ns: u64,
}

/// Enumerate the threads of the current process
#[cfg(target_os = "linux")]
pub fn threads() -> io::Result<Vec<ThreadInfo>> {
    use std::fs;

    let mut threads = Vec::new();
    for entry in fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let dir = entry.path();

        // A thread may exit between read_dir and the reads below
        let Ok(status) = fs::read_to_string(dir.join("status")) else {
            continue;
        };
        let mut info = parse_thread_status(&status);
        info.tid = tid;

        if let Ok(schedstat) = fs::read_to_string(dir.join("schedstat")) {
            if let Some((run_ns, wait_ns)) = parse_schedstat(&schedstat) {
                info.run_ns = run_ns;
                info.wait_ns = wait_ns;
            }
        }
        threads.push(info);
    }

    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Enumerate the threads of the current process
#[cfg(not(target_os = "linux"))]
pub fn threads() -> io::Result<Vec<ThreadInfo>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread enumeration requires procfs",
    ))
}

/// Size of the main thread stack mapping in bytes
#[cfg(target_os = "linux")]
pub fn stack_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| status_kb(&status, "VmStk:"))
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// Size of the main thread stack mapping in bytes
#[cfg(not(target_os = "linux"))]
pub fn stack_bytes() -> u64 {
    0
}

fn status_value<'a>(status: &'a str, field: &str) -> Option<&'a str> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .map(str::trim)
}

fn status_u64(status: &str, field: &str) -> Option<u64> {
    status_value(status, field)?.parse().ok()
}

/// Read a `kB` valued field such as `VmStk:` from a status file
pub(crate) fn status_kb(status: &str, field: &str) -> Option<u64> {
    status_value(status, field)?
        .split_whitespace()
        .next()
        .and_then(|raw| raw.parse().ok())
}

/// Parse the fields of `/proc/<pid>/task/<tid>/status` used by the profiles
pub(crate) fn parse_thread_status(status: &str) -> ThreadInfo {
    ThreadInfo {
        tid: 0,
        name: status_value(status, "Name:").unwrap_or_default().to_string(),
        state: status_value(status, "State:")
            .and_then(|s| s.split_whitespace().next())
            .unwrap_or("?")
            .to_string(),
        voluntary_switches: status_u64(status, "voluntary_ctxt_switches:").unwrap_or(0),
        involuntary_switches: status_u64(status, "nonvoluntary_ctxt_switches:").unwrap_or(0),
        run_ns: 0,
        wait_ns: 0,
    }
}

/// Parse `schedstat`: run time, run-queue wait time, timeslices
pub(crate) fn parse_schedstat(schedstat: &str) -> Option<(u64, u64)> {
    let mut fields = schedstat.split_whitespace().map(|f| f.parse::<u64>().ok());
    let run_ns = fields.next()??;
    let wait_ns = fields.next()??;
    Some((run_ns, wait_ns))
}
