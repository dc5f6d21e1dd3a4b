//! Single-instance process lock
//!
//! The lock is a file holding the owner's PID. It is written to a private
//! temp file first and hard-linked into place, so the lock path never exists
//! without its PID and two processes cannot both win. A file naming a PID
//! that is no longer running (or that cannot be parsed) is stale and gets
//! reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::SchedulerError;

pub trait ProcessLock: Send + Sync {
    /// Take the lock for this process, or report who holds it
    fn try_acquire(&mut self) -> Result<(), SchedulerError>;

    /// Give the lock up; a no-op when not held
    fn release(&mut self) -> Result<(), SchedulerError>;

    /// Whether some live process currently owns the lock
    fn is_held_by_live_process(&self) -> bool;
}

pub struct FileLock {
    path: PathBuf,
    pid: u32,
    held: bool,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_pid(path, std::process::id())
    }

    /// Lock that records `pid` instead of the current process id
    pub fn with_pid(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// PID recorded in the lock file, if there is a readable one
    pub fn holder_pid(&self) -> Option<u32> {
        read_pid(&self.path)
    }

    fn create(&self) -> io::Result<()> {
        let staging = self.sibling("tmp");

        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .and_then(|mut file| {
                writeln!(file, "{}", self.pid)?;
                file.sync_all()
            });
        // hard_link fails with AlreadyExists when the lock is taken
        let linked = written.and_then(|()| fs::hard_link(&staging, &self.path));
        let _ = fs::remove_file(&staging);
        linked
    }

    /// Move a stale lock file out of the way
    ///
    /// The file is renamed to a private tombstone before anything is
    /// deleted, so only the exact file that was judged stale can be removed.
    /// If the tombstone turns out to name a live process, another contender
    /// reclaimed the lock in between and the file is linked back.
    fn reclaim(&self, stale: Option<u32>) -> Result<(), SchedulerError> {
        let tombstone = self.sibling("stale");

        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            // Someone else already moved it
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let moved = read_pid(&tombstone);
        if moved != stale {
            if let Some(pid) = moved.filter(|pid| process_alive(*pid)) {
                debug!(path = %self.path.display(), pid, "Lock was taken while reclaiming, restoring it");
                let restored = fs::hard_link(&tombstone, &self.path);
                let _ = fs::remove_file(&tombstone);
                return match restored {
                    Ok(()) => Err(SchedulerError::AlreadyRunning {
                        pid,
                        path: self.path.clone(),
                    }),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        Err(SchedulerError::AlreadyRunning {
                            pid: read_pid(&self.path).unwrap_or(pid),
                            path: self.path.clone(),
                        })
                    }
                    Err(e) => Err(e.into()),
                };
            }
        }

        match fs::remove_file(&tombstone) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unique path next to the lock file
    fn sibling(&self, suffix: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);

        let mut name = self.path.clone().into_os_string();
        name.push(format!(
            ".{}.{}.{}",
            self.pid,
            SEQ.fetch_add(1, Ordering::Relaxed),
            suffix
        ));
        PathBuf::from(name)
    }
}

impl ProcessLock for FileLock {
    fn try_acquire(&mut self) -> Result<(), SchedulerError> {
        if self.held {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Later passes only happen after moving a stale file aside
        for _ in 0..3 {
            match self.create() {
                Ok(()) => {
                    self.held = true;
                    info!(path = %self.path.display(), pid = self.pid, "Acquired scheduler lock");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match read_pid(&self.path) {
                    Some(pid) if process_alive(pid) => {
                        return Err(SchedulerError::AlreadyRunning {
                            pid,
                            path: self.path.clone(),
                        });
                    }
                    holder => {
                        warn!(
                            path = %self.path.display(),
                            stale_pid = ?holder,
                            "Reclaiming stale scheduler lock"
                        );
                        self.reclaim(holder)?;
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(SchedulerError::Lock(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("lock file {} reappeared while reclaiming it", self.path.display()),
        )))
    }

    fn release(&mut self) -> Result<(), SchedulerError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        // Never delete a lock some other process has taken over
        if read_pid(&self.path) != Some(self.pid) {
            debug!(path = %self.path.display(), "Lock file no longer ours, leaving it");
            return Ok(());
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Released scheduler lock");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_held_by_live_process(&self) -> bool {
        read_pid(&self.path).is_some_and(process_alive)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "Failed to release scheduler lock");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
}

/// Whether a process with this PID exists
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// No portable liveness check; assume the holder is alive
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid_and_release_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.lock");

        let mut lock = FileLock::new(&path);
        lock.try_acquire().unwrap();
        assert_eq!(lock.holder_pid(), Some(std::process::id()));
        assert!(lock.is_held_by_live_process());

        lock.release().unwrap();
        assert!(!path.exists());
        assert!(!lock.is_held_by_live_process());
    }

    #[test]
    fn test_second_lock_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.lock");

        let mut first = FileLock::new(&path);
        first.try_acquire().unwrap();

        let mut second = FileLock::new(&path);
        match second.try_acquire() {
            Err(SchedulerError::AlreadyRunning { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        assert!(!second.is_held());

        // Dropping the refused lock must not remove the holder's file
        drop(second);
        assert!(path.exists());
    }

    #[test]
    fn test_garbage_lock_file_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.lock");
        fs::write(&path, "not a pid").unwrap();

        let mut lock = FileLock::new(&path);
        lock.try_acquire().unwrap();
        assert_eq!(lock.holder_pid(), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_reclaim_keeps_lock_taken_in_between() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.lock");

        // The file seen as stale was replaced by a live holder before removal
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        let late = FileLock::with_pid(&path, 4_000_000);

        match late.reclaim(Some(4_000_001)) {
            Err(SchedulerError::AlreadyRunning { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        assert_eq!(read_pid(&path), Some(std::process::id()));
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_reclaim_removes_the_stale_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.lock");
        fs::write(&path, "4000001\n").unwrap();

        let lock = FileLock::with_pid(&path, 4_000_000);
        lock.reclaim(Some(4_000_001)).unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        // Already gone is fine
        lock.reclaim(Some(4_000_001)).unwrap();
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("scheduler.lock");
        {
            let mut lock = FileLock::new(&path);
            lock.try_acquire().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.lock");

        let mut lock = FileLock::new(&path);
        lock.try_acquire().unwrap();
        fs::write(&path, "1").unwrap();

        lock.release().unwrap();
        assert!(path.exists());
    }
}
