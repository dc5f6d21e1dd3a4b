//! Single-instance guarantees of the scheduler lock across "processes"

use async_trait::async_trait;
use libpostflow::error::SchedulerError;
use libpostflow::scheduler::{Cadence, FileLock, Job, JobScheduler, JobSpec, ProcessLock};
use libpostflow::PostflowError;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

/// PID of a process that has already exited
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl Job for Counter {
    async fn run(&self, _now: i64) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn every_second() -> Cadence {
    "every 1s".parse().unwrap()
}

#[cfg(unix)]
#[test]
fn test_lock_from_exited_process_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scheduler.lock");
    fs::write(&path, format!("{}\n", dead_pid())).unwrap();

    let mut lock = FileLock::new(&path);
    assert!(!lock.is_held_by_live_process());

    lock.try_acquire().unwrap();
    assert_eq!(lock.holder_pid(), Some(std::process::id()));
}

#[test]
fn test_concurrent_acquire_has_one_winner() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scheduler.lock");
    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut lock = FileLock::new(&path);
                barrier.wait();
                let won = lock.try_acquire().is_ok();
                // Keep the winner's lock alive until every thread has tried
                (won, lock)
            })
        })
        .collect();

    let results: Vec<(bool, FileLock)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|(won, _)| *won).count();
    assert_eq!(winners, 1);

    drop(results);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_second_scheduler_refused_until_first_stops() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scheduler.lock");
    let runs = Arc::new(AtomicUsize::new(0));

    let mut first = JobScheduler::new(Box::new(FileLock::new(&path)));
    first
        .add_job(JobSpec::new("tick", every_second()), Arc::new(Counter(runs.clone())))
        .unwrap();
    first.start().unwrap();

    let mut second = JobScheduler::new(Box::new(FileLock::new(&path)));
    second
        .add_job(JobSpec::new("tick", every_second()), Arc::new(Counter(runs.clone())))
        .unwrap();

    let err = second.start().unwrap_err();
    assert!(matches!(
        err,
        PostflowError::Scheduler(SchedulerError::AlreadyRunning { .. })
    ));
    assert_eq!(err.exit_code(), 3);
    assert!(second.registered_jobs().is_empty());
    assert!(!second.is_running());

    first.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!path.exists());

    // The lock is free again; the refused scheduler can now take over
    second.start().unwrap();
    assert_eq!(second.registered_jobs(), vec!["tick".to_string()]);
    second.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_run_once_refused_while_daemon_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scheduler.lock");
    let runs = Arc::new(AtomicUsize::new(0));

    let mut daemon = JobScheduler::new(Box::new(FileLock::new(&path)));
    daemon.start().unwrap();

    let mut once = JobScheduler::new(Box::new(FileLock::new(&path)));
    once.add_job(JobSpec::new("tick", every_second()), Arc::new(Counter(runs.clone())))
        .unwrap();

    let err = once.run_once("tick").await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    daemon.shutdown(Duration::from_secs(1)).await.unwrap();
    assert!(once.run_once("tick").await.unwrap());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
