//! End-to-end scheduling: periodic rewrites of the profile file and
//! the blocking CPU capture window

use heapwatch::system::{
    ProfileDumper, ProfileKind, ProfileRequest, ScheduledDumpLoop, ShutdownCoordinator,
};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::oneshot;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_profile_rewritten_every_interval() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.prof");
    let request = ProfileRequest::new(ProfileKind::Goroutine, &path);

    let stop = CancellationToken::new();
    let dump_loop = tokio::spawn(
        ScheduledDumpLoop::new(Arc::new(ProfileDumper::default()), request, Duration::from_secs(1))
            .run(stop.clone()),
    );

    let started = Instant::now();
    let mut seen: Vec<SystemTime> = Vec::new();
    while started.elapsed() < Duration::from_millis(3500) {
        if let Some(mtime) = modified(&path) {
            if seen.last() != Some(&mtime) {
                seen.push(mtime);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    stop.cancel();
    let ticks = assert_ok!(dump_loop.await);
    assert!(ticks >= 3, "only {} ticks", ticks);
    assert!(seen.len() >= 3, "file rewritten {} times", seen.len());
    assert!(seen.windows(2).all(|w| w[0] < w[1]));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(!contents.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signal_stops_rewrites() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threads.prof");
    let request = ProfileRequest::new(ProfileKind::ThreadCreate, &path);
    let interval = Duration::from_millis(300);

    let stop = CancellationToken::new();
    let dump_loop = tokio::spawn(
        ScheduledDumpLoop::new(Arc::new(ProfileDumper::default()), request, interval)
            .run(stop.clone()),
    );
    let (tx, rx) = oneshot::channel::<()>();
    let coordinator = tokio::spawn(ShutdownCoordinator::new(stop.clone()).run(async move {
        let _ = rx.await;
    }));

    tokio::time::sleep(interval * 2 + interval / 2).await;
    tx.send(()).unwrap();
    assert_ok!(coordinator.await);
    assert_eq!(assert_ok!(dump_loop.await), 2);

    let last = modified(&path).unwrap();
    tokio::time::sleep(interval * 3).await;
    assert_eq!(modified(&path), Some(last));
}

#[test]
fn test_cpu_dump_blocks_for_default_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu.pprof");
    let dumper = ProfileDumper::default();
    assert_eq!(dumper.cpu_window(), Duration::from_secs(10));

    // Keep a thread busy so the profiler has something to sample
    let busy = CancellationToken::new();
    let spinner = {
        let busy = busy.clone();
        std::thread::spawn(move || {
            let mut x = 0u64;
            while !busy.is_cancelled() {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            }
            x
        })
    };

    let started = Instant::now();
    assert_ok!(dumper.dump(ProfileKind::Cpu, &path));
    assert!(started.elapsed() >= Duration::from_secs(10));

    busy.cancel();
    spinner.join().unwrap();
    assert!(std::fs::metadata(&path).unwrap().len() > 0);
}
