//! Cross-process exclusive lock on the heatmap ledger
//!
//! The lock is a file next to the ledger, created with `create_new` so that
//! exactly one process can hold it. It stores a random token; release only
//! removes a lock file still carrying the holder's token.
//!
//! # Orphaned locks
//! A worker killed inside the critical section leaves its lock file behind.
//! A lock file older than the configured stale age is broken. Breaking is
//! serialized through a second `create_new` file (`{lock}.break`): only its
//! holder may remove the lock, and only if the lock still carries the token
//! that was judged stale. A live lock is never moved or removed by a waiter.

use neuroprep_common::config::HeatmapConfig;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process held the lock for the whole timeout
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    /// Lock file could not be created, read or removed
    #[error("Lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Acquisition timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl From<&HeatmapConfig> for LockPolicy {
    fn from(config: &HeatmapConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.lock_timeout_secs),
            stale_after: Duration::from_secs(config.lock_stale_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from(&HeatmapConfig::default())
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    released: bool,
}

enum Holder {
    Gone,
    Fresh,
    Stale(String),
}

impl LockGuard {
    /// Wait until the lock at `path` is ours
    pub async fn acquire(path: &Path, policy: &LockPolicy) -> Result<LockGuard, LockError> {
        let token = Uuid::new_v4().to_string();
        let start = Instant::now();

        loop {
            match try_create(path, &token) {
                Ok(()) => {
                    debug!(lock = %path.display(), "Lock acquired");
                    return Ok(LockGuard {
                        path: path.to_path_buf(),
                        token,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LockError::io(path, e)),
            }

            match inspect(path, policy.stale_after)? {
                Holder::Gone => continue,
                Holder::Stale(stale_token) => {
                    if break_stale(path, &stale_token, policy.stale_after)? {
                        continue;
                    }
                }
                Holder::Fresh => {}
            }

            let waited = start.elapsed();
            if waited >= policy.timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }

            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now, reporting failures that drop would swallow
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        remove_if_owned(&self.path, &self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_if_owned(&self.path, &self.token) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

fn try_create(path: &Path, token: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;

    let written = writeln!(file, "{}", token).and_then(|_| file.sync_all());
    if let Err(e) = written {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn read_token(path: &Path) -> std::io::Result<String> {
    let content = fs::read_to_string(path)?;
    Ok(content.lines().next().unwrap_or("").trim().to_string())
}

fn inspect(path: &Path, stale_after: Duration) -> Result<Holder, LockError> {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Gone),
        Err(e) => return Err(LockError::io(path, e)),
    };

    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age <= stale_after {
        return Ok(Holder::Fresh);
    }

    match read_token(path) {
        Ok(token) => Ok(Holder::Stale(token)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Holder::Gone),
        Err(e) => Err(LockError::io(path, e)),
    }
}

fn breaker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".break");
    PathBuf::from(name)
}

/// Remove the lock at `path` if it still holds `stale_token`
///
/// Returns `false` when another waiter is breaking it right now.
fn break_stale(path: &Path, stale_token: &str, stale_after: Duration) -> Result<bool, LockError> {
    let breaker = breaker_path(path);
    let breaker_token = Uuid::new_v4().to_string();

    match try_create(&breaker, &breaker_token) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // A breaker that died mid-break leaves its file behind too
            if let Holder::Stale(orphan) = inspect(&breaker, stale_after)? {
                warn!(lock = %breaker.display(), "Removing orphaned lock breaker");
                remove_if_owned(&breaker, &orphan)?;
            }
            return Ok(false);
        }
        Err(e) => return Err(LockError::io(&breaker, e)),
    }

    let result = match read_token(path) {
        Ok(current) if current == stale_token => match fs::remove_file(path) {
            Ok(()) => {
                warn!(lock = %path.display(), "Broke stale lock left by a previous worker");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(LockError::io(path, e)),
        },
        Ok(_) => {
            debug!(lock = %path.display(), "Stale lock already replaced");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(LockError::io(path, e)),
    };

    remove_if_owned(&breaker, &breaker_token)?;
    result
}

fn remove_if_owned(path: &Path, token: &str) -> Result<(), LockError> {
    match read_token(path) {
        Ok(current) if current == token => {
            fs::remove_file(path).map_err(|e| LockError::io(path, e))?;
            debug!(lock = %path.display(), "Lock released");
            Ok(())
        }
        Ok(_) => {
            warn!(lock = %path.display(), "Lock no longer ours, leaving it in place");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(lock = %path.display(), "Lock file vanished before release");
            Ok(())
        }
        Err(e) => Err(LockError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_policy() -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_millis(200),
            stale_after: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");

        let guard = LockGuard::acquire(&path, &fast_policy()).await.unwrap();
        assert!(path.exists());
        guard.release().unwrap();
        assert!(!path.exists());

        {
            let _guard = LockGuard::acquire(&path, &fast_policy()).await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists(), "drop must release the lock");
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");

        let _held = LockGuard::acquire(&path, &fast_policy()).await.unwrap();
        let result = LockGuard::acquire(&path, &fast_policy()).await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert!(path.exists(), "timed-out waiter must not touch the holder's lock");
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");
        let policy = LockPolicy {
            timeout: Duration::from_secs(5),
            ..fast_policy()
        };

        let held = LockGuard::acquire(&path, &policy).await.unwrap();
        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move { LockGuard::acquire(&waiter_path, &policy).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let guard = waiter.await.unwrap().unwrap();
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");
        fs::write(&path, "orphaned-token\n").unwrap();

        let policy = LockPolicy {
            stale_after: Duration::ZERO,
            ..fast_policy()
        };
        // Any measurable age exceeds a zero stale age
        tokio::time::sleep(Duration::from_millis(20)).await;

        let guard = LockGuard::acquire(&path, &policy).await.unwrap();
        assert_ne!(read_token(&path).unwrap(), "orphaned-token");
        drop(guard);

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "no stale copies may remain");
    }

    #[tokio::test]
    async fn test_breaking_never_touches_a_replaced_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");

        // Another waiter broke "orphaned-token" first and now holds the lock
        let live = LockGuard::acquire(&path, &fast_policy()).await.unwrap();
        assert!(break_stale(&path, "orphaned-token", Duration::from_secs(3600)).unwrap());

        assert_eq!(read_token(&path).unwrap(), live.token);
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["ledger.lock"], "no breaker or moved copies may remain");

        live.release().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_breaker_backs_off() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");
        fs::write(&path, "orphaned-token\n").unwrap();
        fs::write(breaker_path(&path), "other-breaker\n").unwrap();

        assert!(!break_stale(&path, "orphaned-token", Duration::from_secs(3600)).unwrap());
        assert_eq!(read_token(&path).unwrap(), "orphaned-token");
        assert!(breaker_path(&path).exists());
    }

    #[tokio::test]
    async fn test_orphaned_breaker_is_cleared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");
        fs::write(&path, "orphaned-token\n").unwrap();
        fs::write(breaker_path(&path), "dead-breaker\n").unwrap();

        let policy = LockPolicy {
            stale_after: Duration::ZERO,
            ..fast_policy()
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let guard = LockGuard::acquire(&path, &policy).await.unwrap();
        assert!(!breaker_path(&path).exists());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");
        fs::write(&path, "someone-else\n").unwrap();

        remove_if_owned(&path, "mine").unwrap();
        assert!(path.exists());
    }
}
