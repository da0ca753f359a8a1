//! Single-instance lock file.
//!
//! Format: one line holding the owner's pid. Staleness is decided purely by
//! pid liveness, so a recycled pid can keep a dead launcher's lock alive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::process::is_process_alive;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::for_pid(path, std::process::id())
    }

    pub(crate) fn for_pid(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the lock file, if it parses.
    pub fn recorded_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.lines().next()?.trim().parse().ok())
    }

    /// Take the lock unless another live launcher holds it.
    ///
    /// Absent, unparsable and stale files are overwritten.
    pub fn acquire(&self) -> Result<bool> {
        match self.recorded_pid() {
            Some(pid) if pid != self.pid && is_process_alive(pid) => {
                log::warn!("Launcher already running (pid {})", pid);
                return Ok(false);
            }
            Some(pid) if pid != self.pid => {
                log::info!("Replacing stale lock left by pid {}", pid);
            }
            _ => {}
        }
        self.write_with_retry()?;
        log::debug!("Acquired lock {:?} (pid {})", self.path, self.pid);
        Ok(true)
    }

    /// Delete the lock file if it still names us.
    pub fn release(&self) -> Result<()> {
        match self.recorded_pid() {
            Some(pid) if pid == self.pid => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AppError::lock(format!(
                    "failed to remove {}: {e}",
                    self.path.display()
                ))),
            },
            Some(pid) => {
                log::warn!("Lock now belongs to pid {}; leaving it alone", pid);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Acquire and wrap in a guard, or report the holder as an error.
    pub fn acquire_guard(self) -> Result<LockGuard> {
        if self.acquire()? {
            Ok(LockGuard { lock: self })
        } else {
            Err(AppError::lock_held(self.recorded_pid().unwrap_or_default()))
        }
    }

    fn write_with_retry(&self) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match self.write_atomic() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Lock write attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < WRITE_ATTEMPTS {
                        std::thread::sleep(WRITE_RETRY_DELAY);
                    }
                }
            }
        }
        Err(AppError::lock(format!(
            "failed to write {}: {}",
            self.path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn write_atomic(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut temp = self.path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, format!("{}\n", self.pid))?;
        fs::rename(&temp, &self.path)
    }
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: InstanceLock,
}

impl LockGuard {
    pub fn lock(&self) -> &InstanceLock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            log::warn!("Failed to release lock: {}", e);
        }
    }
}
