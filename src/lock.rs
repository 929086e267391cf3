//! Per-session exclusion locks. Unix-only.
//!
//! Two-tier acquisition: an advisory `flock`-style lock is preferred; on
//! filesystems without advisory locking the fallback is atomic
//! create-if-absent plus a PID sentinel. An existing lock whose owning PID
//! is dead is stale and gets replaced. `--force` replaces a live owner.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::LockError;

/// JSON body of a lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
    pub session: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Signal-0 liveness probe.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Held lock. Releasing removes the file only if this process still owns it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    session: String,
    // Keeps the advisory lock held for the guard's lifetime.
    file: Option<File>,
    released: bool,
}

impl LockGuard {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file if we are still the recorded owner.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let ours = match read_lock_file(&self.path) {
            Ok(Some(lock)) => lock.pid == std::process::id(),
            _ => false,
        };
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != IoErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
                }
            }
        }
        // Dropping the handle releases the advisory lock.
        self.file.take();
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Acquires and scavenges session locks under one locks root.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks_root: PathBuf,
}

impl LockManager {
    pub fn new(locks_root: impl Into<PathBuf>) -> Self {
        Self {
            locks_root: locks_root.into(),
        }
    }

    fn lock_path(&self, session: &str) -> PathBuf {
        self.locks_root.join(format!("{}.lock", session))
    }

    /// Acquire the lock for a session.
    ///
    /// Refuses with `LockError::Held` when another live process owns it and
    /// `force` is false. A dead owner is treated as stale and replaced.
    pub fn acquire(&self, session: &str, force: bool) -> Result<LockGuard, LockError> {
        std::fs::create_dir_all(&self.locks_root)?;
        let path = self.lock_path(session);

        // Tier 1: advisory lock on the (possibly fresh) lock file.
        match OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    // A sentinel-tier owner holds no advisory lock, so a
                    // successful flock still has to respect a live PID left
                    // in the file.
                    if let Ok(Some(existing)) = read_lock_file(&path) {
                        if existing.pid != std::process::id() && pid_alive(existing.pid) && !force {
                            let _ = FileExt::unlock(&file);
                            return Err(LockError::Held {
                                session: session.to_string(),
                                pid: existing.pid,
                            });
                        }
                    }
                    write_sentinel(&file, session)?;
                    debug!(session, path = %path.display(), "lock acquired (flock)");
                    return Ok(LockGuard {
                        path,
                        session: session.to_string(),
                        file: Some(file),
                        released: false,
                    });
                }
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                    return self.contend(session, &path, force);
                }
                Err(_) => {
                    // Advisory locks unsupported here; fall through to the
                    // create-exclusive tier.
                    drop(file);
                }
            },
            Err(e) => return Err(LockError::Io(e)),
        }

        // Tier 2: atomic create-if-absent with PID sentinel.
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(file) => {
                write_sentinel(&file, session)?;
                debug!(session, path = %path.display(), "lock acquired (sentinel)");
                Ok(LockGuard {
                    path,
                    session: session.to_string(),
                    file: None,
                    released: false,
                })
            }
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                self.contend(session, &path, force)
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Decide what to do about an existing lock: stale owners are replaced,
    /// live owners refuse unless forced.
    fn contend(&self, session: &str, path: &Path, force: bool) -> Result<LockGuard, LockError> {
        let owner = read_lock_file(path).map_err(|e| LockError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let owner_pid = owner.as_ref().map(|l| l.pid).unwrap_or(0);
        let stale = !pid_alive(owner_pid);

        if !stale && !force {
            return Err(LockError::Held {
                session: session.to_string(),
                pid: owner_pid,
            });
        }

        if stale {
            warn!(session, pid = owner_pid, "replacing stale lock");
        } else {
            warn!(session, pid = owner_pid, "forcibly replacing live lock");
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(LockError::Io(e)),
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        // Best effort: hold the advisory lock too when the platform has it.
        let held = FileExt::try_lock_exclusive(&file).is_ok();
        write_sentinel(&file, session)?;
        Ok(LockGuard {
            path: path.to_path_buf(),
            session: session.to_string(),
            file: held.then_some(file),
            released: false,
        })
    }

    /// Delete every lock whose owning PID is dead. Returns removed sessions.
    pub fn cleanup_stale(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        if !self.locks_root.exists() {
            return Ok(removed);
        }
        for entry in std::fs::read_dir(&self.locks_root)
            .with_context(|| format!("failed to scan {}", self.locks_root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let lock = match read_lock_file(&path) {
                Ok(Some(lock)) => lock,
                // Unreadable sentinel with no way to check liveness: leave it.
                _ => continue,
            };
            if !pid_alive(lock.pid) {
                debug!(session = %lock.session, pid = lock.pid, "removing stale lock");
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed.push(lock.session);
            }
        }
        Ok(removed)
    }

    /// Current owner of a session lock, if any.
    pub fn owner(&self, session: &str) -> Result<Option<LockFile>> {
        read_lock_file(&self.lock_path(session))
    }
}

fn write_sentinel(mut file: &File, session: &str) -> Result<(), LockError> {
    let lock = LockFile {
        session: session.to_string(),
        pid: std::process::id(),
        started_at: Utc::now(),
    };
    let body = serde_json::to_string(&lock).map_err(|e| {
        LockError::Io(std::io::Error::other(e))
    })?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(body.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn read_lock_file(path: &Path) -> Result<Option<LockFile>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut body = String::new();
    file.read_to_string(&mut body)?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    let lock = serde_json::from_str(&body)
        .with_context(|| format!("lock file {} is not valid JSON", path.display()))?;
    Ok(Some(lock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_pid_sentinel() {
        let dir = tempdir().unwrap();
        let mgr = LockManager::new(dir.path());
        let guard = mgr.acquire("alpha", false).unwrap();

        let owner = mgr.owner("alpha").unwrap().unwrap();
        assert_eq!(owner.session, "alpha");
        assert_eq!(owner.pid, std::process::id());
        guard.release();
        assert!(mgr.owner("alpha").unwrap().is_none());
    }

    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let mgr = LockManager::new(dir.path());
        let path = dir.path().join("alpha.lock");
        // A PID from a long-dead process. PID (2^22 - 1) is the default
        // Linux pid_max ceiling, so anything near it is very unlikely live.
        let dead = LockFile {
            session: "alpha".into(),
            pid: 4_194_200,
            started_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&dead).unwrap()).unwrap();

        let guard = mgr.acquire("alpha", false).unwrap();
        let owner = mgr.owner("alpha").unwrap().unwrap();
        assert_eq!(owner.pid, std::process::id());
        drop(guard);
    }

    #[test]
    fn live_owner_refuses_without_force() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alpha.lock");
        // Sentinel naming a live process (ourselves) but with no advisory
        // lock held, as if written by the sentinel-only tier.
        let live = LockFile {
            session: "alpha".into(),
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&live).unwrap()).unwrap();

        // A second manager in another root still sees the advisory tier
        // succeed on a fresh file, so test the sentinel path directly.
        let mgr = LockManager::new(dir.path());
        let err = mgr
            .contend("alpha", &path, false)
            .expect_err("live owner must refuse");
        match err {
            LockError::Held { session, pid } => {
                assert_eq!(session, "alpha");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected Held, got {other}"),
        }

        // Force takes it over.
        let guard = mgr.contend("alpha", &path, true).unwrap();
        drop(guard);
    }

    #[test]
    fn cleanup_removes_only_dead_owners() {
        let dir = tempdir().unwrap();
        let mgr = LockManager::new(dir.path());

        let dead = LockFile {
            session: "dead".into(),
            pid: 4_194_201,
            started_at: Utc::now(),
        };
        std::fs::write(
            dir.path().join("dead.lock"),
            serde_json::to_string(&dead).unwrap(),
        )
        .unwrap();
        let _guard = mgr.acquire("live", false).unwrap();

        let removed = mgr.cleanup_stale().unwrap();
        assert_eq!(removed, vec!["dead".to_string()]);
        assert!(mgr.owner("live").unwrap().is_some());
    }

    #[test]
    fn release_is_idempotent_and_owner_checked() {
        let dir = tempdir().unwrap();
        let mgr = LockManager::new(dir.path());
        let guard = mgr.acquire("alpha", false).unwrap();
        let path = guard.path().to_path_buf();

        // Another process took over (force); our release must not remove it.
        let foreign = LockFile {
            session: "alpha".into(),
            pid: 4_194_202,
            started_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&foreign).unwrap()).unwrap();
        guard.release();
        assert!(path.exists(), "non-owner must not remove the lock");
    }
}
