//! Exclusive operation lock
//!
//! At most one apply may run against a state directory. The lock file is
//! created with an exclusive-create open, so two processes racing to create
//! it cannot both succeed. A lock whose owner is gone or which is older than
//! the staleness threshold is removed on sight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fsutil::create_private;
use crate::retry::{RetryConfig, with_retry};
use crate::state::StateStore;

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub operation: String,
    pub tool_version: String,
    pub cwd: PathBuf,
}

/// Result of inspecting the lock file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    /// Parsed lock contents; `None` if absent or unreadable
    pub info: Option<LockInfo>,
    /// A stale lock was found and removed
    pub stale: bool,
}

/// Held lock; the lock file is removed when this is dropped
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Release explicitly, surfacing any IO error
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_lock_file(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_lock_file(&self.path) {
            log::error!("failed to release lock {}: {}", self.path.display(), e);
        } else {
            log::debug!("released lock {}", self.path.display());
        }
    }
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

impl StateStore {
    /// Inspect the lock file, removing it if stale
    pub fn is_locked(&self) -> Result<LockStatus> {
        let path = self.lock_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockStatus::default()),
            Err(e) => return Err(Error::io(&path, e)),
        };

        let info: Option<LockInfo> = serde_json::from_str(&content).ok();
        let stale = match &info {
            Some(info) => {
                let age = (Utc::now() - info.created_at).to_std().unwrap_or_default();
                age > self.stale_after || !process_alive(info.pid)
            }
            // Unreadable: possibly still being written, judge by file age
            None => file_age(&path).is_some_and(|age| age > self.stale_after),
        };

        if !stale {
            return Ok(LockStatus {
                locked: true,
                info,
                stale: false,
            });
        }

        log::warn!(
            "removing stale lock {} (pid {})",
            path.display(),
            info.as_ref()
                .map_or_else(|| "unknown".to_string(), |i| i.pid.to_string())
        );
        match clear_stale(&path, &content)? {
            None => Ok(LockStatus {
                locked: false,
                info,
                stale: true,
            }),
            Some(fresh) => Ok(LockStatus {
                locked: true,
                info: serde_json::from_str(&fresh).ok(),
                stale: false,
            }),
        }
    }

    /// Take the lock for `operation`, failing if a live operation holds it
    pub fn acquire_lock(&self, operation: &str) -> Result<LockGuard> {
        match self.create_lock(operation) {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let status = self.is_locked()?;
                if status.locked {
                    return Err(held(status.info.as_ref()));
                }
                // Stale lock was cleared; one more try
                self.create_lock(operation).map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        held(None)
                    } else {
                        Error::io(self.lock_path(), e)
                    }
                })
            }
            Err(e) => Err(Error::io(self.lock_path(), e)),
        }
    }

    /// [`acquire_lock`](Self::acquire_lock) with bounded exponential backoff
    pub fn acquire_lock_with_retry(
        &self,
        operation: &str,
        retry: &RetryConfig,
    ) -> Result<LockGuard> {
        with_retry(retry, || self.acquire_lock(operation))
    }

    /// Remove the lock file; a missing lock is not an error
    pub fn release_lock(&self) -> Result<()> {
        remove_lock_file(&self.lock_path())
    }

    fn create_lock(&self, operation: &str) -> io::Result<LockGuard> {
        fs::create_dir_all(self.dir())?;
        let path = self.lock_path();
        let mut file = create_private(&path)?;

        let info = LockInfo {
            pid: std::process::id(),
            created_at: Utc::now(),
            operation: operation.to_string(),
            tool_version: self.tool_version.clone(),
            cwd: std::env::current_dir().unwrap_or_default(),
        };

        let written = serde_json::to_vec_pretty(&info)
            .map_err(io::Error::other)
            .and_then(|bytes| file.write_all(&bytes))
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        log::debug!("acquired lock {} for {}", path.display(), operation);
        Ok(LockGuard {
            path,
            released: false,
        })
    }
}

/// Remove the lock at `path` only if it still holds `stale`
///
/// The file is renamed aside before it is compared, so a lock another
/// process created after `stale` was read is never deleted. Returns the
/// contents of such a fresh lock after putting it back.
fn clear_stale(path: &Path, stale: &str) -> Result<Option<String>> {
    static ASIDE: AtomicU64 = AtomicU64::new(0);
    let aside = path.with_extension(format!(
        "stale-{}-{}",
        std::process::id(),
        ASIDE.fetch_add(1, Ordering::Relaxed)
    ));

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(path, e)),
    }
    let moved = fs::read_to_string(&aside).map_err(|e| Error::io(&aside, e))?;
    if moved == stale {
        remove_lock_file(&aside)?;
        return Ok(None);
    }

    log::debug!("lock {} was replaced while clearing it", path.display());
    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            log::warn!("lock {} was taken again before it could be restored", path.display());
        }
        Err(e) => {
            log::error!("failed to restore lock {}: {e}", path.display());
        }
    }
    remove_lock_file(&aside)?;
    Ok(Some(moved))
}

fn held(info: Option<&LockInfo>) -> Error {
    Error::LockHeld {
        pid: info.map(|i| i.pid),
        operation: info.map(|i| i.operation.clone()),
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

/// Whether `pid` names a running process
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs the permission and existence checks only
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
