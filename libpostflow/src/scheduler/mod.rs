//! In-process job scheduler
//!
//! Runs a fixed set of named jobs, each on its own cadence, inside one
//! long-lived process. A [`ProcessLock`] guarantees a single scheduler per
//! host: [`JobScheduler::start`] takes it before spawning anything and
//! [`JobScheduler::shutdown`] always gives it back.
//!
//! Every job gets its own tokio task that sleeps until the next fire time,
//! runs the job to completion and computes the following fire time. A job
//! therefore never overlaps with itself. Errors and panics from a job are
//! logged and the loop carries on.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JobConfig;
use crate::error::{Result, SchedulerError};

pub mod cadence;
pub mod jobs;
pub mod lock;

pub use cadence::Cadence;
pub use jobs::{
    configured_jobs, DispatchDuePostsJob, FetchEngagementJob, RefreshCredentialsJob,
    RefreshSummary, SyncPostsJob,
};
pub use lock::{FileLock, ProcessLock};

/// Registration details for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub cadence: Cadence,
    /// Collapse a backlog of missed fires into a single run
    pub coalesce: bool,
    /// A fire noticed later than this after its due time is skipped
    pub misfire_grace: Duration,
}

impl JobSpec {
    pub fn new(name: &str, cadence: Cadence) -> Self {
        Self {
            name: name.to_string(),
            cadence,
            coalesce: true,
            misfire_grace: Duration::from_secs(30),
        }
    }

    pub fn from_config(name: &str, config: &JobConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            cadence: config.cadence(name)?,
            coalesce: config.coalesce,
            misfire_grace: config.misfire_grace(name)?,
        })
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn with_misfire_grace(mut self, grace: Duration) -> Self {
        self.misfire_grace = grace;
        self
    }
}

/// Work the scheduler can fire
///
/// `now` is the fire time in unix seconds; jobs read their work from storage.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, now: i64) -> anyhow::Result<()>;
}

pub struct JobScheduler {
    lock: Box<dyn ProcessLock>,
    pending: Vec<(JobSpec, Arc<dyn Job>)>,
    running: Vec<(String, JoinHandle<()>)>,
    shutdown_tx: watch::Sender<bool>,
    started: bool,
    stopped: bool,
}

impl JobScheduler {
    pub fn new(lock: Box<dyn ProcessLock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            lock,
            pending: Vec::new(),
            running: Vec::new(),
            shutdown_tx,
            started: false,
            stopped: false,
        }
    }

    /// Queue a job; it starts running once [`start`](Self::start) succeeds
    pub fn add_job(&mut self, spec: JobSpec, job: Arc<dyn Job>) -> Result<()> {
        if self.started {
            return Err(SchedulerError::Registration(format!(
                "cannot add '{}' after the scheduler has started",
                spec.name
            ))
            .into());
        }
        if self.pending.iter().any(|(existing, _)| existing.name == spec.name) {
            return Err(
                SchedulerError::Registration(format!("job '{}' is already registered", spec.name))
                    .into(),
            );
        }

        debug!(job = %spec.name, cadence = %spec.cadence, "Job added");
        self.pending.push((spec, job));
        Ok(())
    }

    /// Take the process lock and spawn one task per job
    ///
    /// When the lock is held by another live process this fails with
    /// `AlreadyRunning` and nothing is spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if self.stopped {
            return Err(SchedulerError::Registration("scheduler was shut down".to_string()).into());
        }

        self.lock.try_acquire()?;
        self.started = true;

        for (spec, job) in self.pending.drain(..) {
            info!(
                job = %spec.name,
                cadence = %spec.cadence,
                coalesce = spec.coalesce,
                misfire_grace = ?spec.misfire_grace,
                "Registering job"
            );
            let name = spec.name.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(job_loop(spec, job, shutdown));
            self.running.push((name, handle));
        }

        info!(jobs = self.running.len(), "Scheduler started");
        Ok(())
    }

    /// Names of the jobs with a live task
    pub fn registered_jobs(&self) -> Vec<String> {
        self.running.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }

    /// Run one registered job immediately, holding the lock for its duration
    ///
    /// Returns whether the job completed without error.
    pub async fn run_once(&mut self, name: &str) -> Result<bool> {
        let job = self
            .pending
            .iter()
            .find(|(spec, _)| spec.name == name)
            .map(|(_, job)| Arc::clone(job))
            .ok_or_else(|| SchedulerError::Registration(format!("unknown job '{}'", name)))?;

        self.lock.try_acquire()?;
        let succeeded = execute_job(name, job.as_ref(), Utc::now().timestamp()).await;
        self.lock.release()?;

        Ok(succeeded)
    }

    /// Stop firing new runs, give in-flight runs up to `drain` to finish,
    /// then release the lock
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&mut self, drain: Duration) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        info!(jobs = self.running.len(), drain = ?drain, "Scheduler shutting down");
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + drain;
        for (name, mut handle) in self.running.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => debug!(job = %name, "Job task stopped"),
                Ok(Err(e)) => warn!(job = %name, error = %e, "Job task ended abnormally"),
                Err(_) => {
                    warn!(job = %name, "Job still running after drain timeout, aborting");
                    handle.abort();
                }
            }
        }

        self.lock.release()?;
        info!("Scheduler stopped");
        Ok(())
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        for (_, handle) in &self.running {
            handle.abort();
        }
        if let Err(e) = self.lock.release() {
            warn!(error = %e, "Failed to release scheduler lock on drop");
        }
    }
}

async fn job_loop(spec: JobSpec, job: Arc<dyn Job>, mut shutdown: watch::Receiver<bool>) {
    let mut due = spec.cadence.next_after(Utc::now());

    loop {
        let wait = until(due);
        debug!(job = %spec.name, next = %due, "Waiting for next fire");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let fired_at = Utc::now();
        let late = (fired_at - due).to_std().unwrap_or(Duration::ZERO);
        if late > spec.misfire_grace {
            warn!(
                job = %spec.name,
                due = %due,
                late_by = ?late,
                "Missed fire time beyond grace period, skipping"
            );
        } else {
            execute_job(&spec.name, job.as_ref(), fired_at.timestamp()).await;
        }

        due = if spec.coalesce {
            spec.cadence.next_after(Utc::now())
        } else {
            spec.cadence.next_after(due)
        };
    }

    debug!(job = %spec.name, "Job loop exited");
}

fn until(due: DateTime<Utc>) -> Duration {
    (due - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Run a job, containing any error or panic it produces
pub async fn execute_job(name: &str, job: &dyn Job, now: i64) -> bool {
    let started = Instant::now();
    info!(job = name, "Job started");

    match AssertUnwindSafe(job.run(now)).catch_unwind().await {
        Ok(Ok(())) => {
            info!(
                job = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job finished"
            );
            true
        }
        Ok(Err(e)) => {
            error!(job = name, error = %format!("{:#}", e), "Job failed");
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(job = name, panic = %message, "Job panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Job for Counter {
        async fn run(&self, _now: i64) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Job for Failing {
        async fn run(&self, _now: i64) -> anyhow::Result<()> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct Panicking(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Job for Panicking {
        async fn run(&self, _now: i64) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("job blew up");
        }
    }

    fn every(millis: u64) -> Cadence {
        Cadence::Every(Duration::from_millis(millis))
    }

    fn scheduler(dir: &TempDir) -> JobScheduler {
        JobScheduler::new(Box::new(FileLock::new(dir.path().join("scheduler.lock"))))
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler(&dir);
        let count = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_job(JobSpec::new("tick", every(50)), Arc::new(Counter(count.clone())))
            .unwrap();
        assert!(scheduler
            .add_job(JobSpec::new("tick", every(50)), Arc::new(Counter(count)))
            .is_err());
    }

    #[tokio::test]
    async fn test_jobs_fire_and_shutdown_releases_lock() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("scheduler.lock");
        let mut scheduler = scheduler(&dir);
        let count = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_job(JobSpec::new("tick", every(40)), Arc::new(Counter(count.clone())))
            .unwrap();
        scheduler.start().unwrap();
        assert!(lock_path.exists());
        assert_eq!(scheduler.registered_jobs(), vec!["tick".to_string()]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown(Duration::from_secs(1)).await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 2);
        assert!(!lock_path.exists());

        // Second shutdown is a no-op
        scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_and_panicking_jobs_do_not_stop_others() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler(&dir);
        let ticks = Arc::new(AtomicUsize::new(0));
        let panics = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_job(JobSpec::new("tick", every(40)), Arc::new(Counter(ticks.clone())))
            .unwrap();
        scheduler.add_job(JobSpec::new("fail", every(40)), Arc::new(Failing)).unwrap();
        scheduler
            .add_job(JobSpec::new("panic", every(40)), Arc::new(Panicking(panics.clone())))
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown(Duration::from_secs(1)).await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        // The panicking job keeps getting fired
        assert!(panics.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_second_instance_registers_nothing() {
        let dir = TempDir::new().unwrap();
        let mut first = scheduler(&dir);
        first.start().unwrap();

        let mut second = scheduler(&dir);
        second
            .add_job(JobSpec::new("tick", every(40)), Arc::new(Counter(Arc::new(AtomicUsize::new(0)))))
            .unwrap();

        match second.start() {
            Err(crate::error::PostflowError::Scheduler(SchedulerError::AlreadyRunning { pid, .. })) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        assert!(second.registered_jobs().is_empty());

        first.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_once_reports_outcome() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler(&dir);
        let count = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_job(JobSpec::new("tick", every(60_000)), Arc::new(Counter(count.clone())))
            .unwrap();
        scheduler.add_job(JobSpec::new("fail", every(60_000)), Arc::new(Failing)).unwrap();

        assert!(scheduler.run_once("tick").await.unwrap());
        assert!(!scheduler.run_once("fail").await.unwrap());
        assert!(scheduler.run_once("missing").await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("scheduler.lock").exists());
    }

    #[test]
    fn test_spec_from_config() {
        let config = JobConfig {
            cadence: "hourly at :45".to_string(),
            coalesce: false,
            misfire_grace: "2m".to_string(),
            enabled: true,
        };

        let spec = JobSpec::from_config("fetch_engagement", &config).unwrap();
        assert_eq!(spec.cadence, Cadence::EveryHours { hours: 1, minute: 45 });
        assert!(!spec.coalesce);
        assert_eq!(spec.misfire_grace, Duration::from_secs(120));
    }
}
