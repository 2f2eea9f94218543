//! Dispatch run lock.
//!
//! A lock file records the holder's process id and acquisition time.
//! Overlapping dispatch triggers are expected and harmless: a run that
//! finds a live holder exits without side effects, and a run that finds
//! a dead holder (crashed mid-pass) reclaims the lock. Scope is one full
//! dispatch pass; per-send hangs are bounded by the transport timeout,
//! not by the lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// ── Errors ──────────────────────────────────────────────────────

/// Lock acquisition errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another dispatch run currently holds the lock. A clean no-op
    /// outcome, not a failure.
    #[error("dispatch lock held by pid {pid} since {acquired_at}")]
    Busy {
        /// The holder's process id.
        pid: u32,
        /// When the holder acquired the lock.
        acquired_at: DateTime<Utc>,
    },
    /// Filesystem failure creating, reading, or removing the lock file.
    #[error("lock io error at {path}: {source}")]
    Io {
        /// The lock file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
}

// ── Holder record ───────────────────────────────────────────────

/// Contents of the lock file.
#[derive(Debug, Serialize, Deserialize)]
struct Holder {
    /// Process id of the run that acquired the lock.
    pid: u32,
    /// Acquisition timestamp.
    acquired_at: DateTime<Utc>,
}

/// Whether the recorded holder should still be considered alive.
///
/// Uses `/proc/<pid>` where procfs exists; elsewhere falls back to the
/// record's age against the staleness window. A reused pid is accepted
/// as alive — the conservative direction, since a busy exit is harmless.
fn holder_alive(holder: &Holder, now: DateTime<Utc>, stale_after: Duration) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.is_dir() {
        proc_root.join(holder.pid.to_string()).exists()
    } else {
        now.signed_duration_since(holder.acquired_at) < stale_after
    }
}

// ── DispatchLock ────────────────────────────────────────────────

/// Exclusive lock over one dispatch pass. Released on drop.
#[derive(Debug)]
pub struct DispatchLock {
    path: PathBuf,
    released: bool,
}

impl DispatchLock {
    /// Acquire the lock, reclaiming it from a dead holder if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Busy`] when a live holder exists (the caller
    /// should exit cleanly), or [`LockError::Io`] on filesystem failure.
    pub fn acquire(
        path: impl Into<PathBuf>,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, LockError> {
        let path = path.into();
        match Self::try_create(&path, now) {
            Ok(lock) => Ok(lock),
            Err(LockError::Busy { .. }) => {
                // A lock file exists — decide whether its holder is dead.
                match Self::read_holder(&path) {
                    Some(holder) if holder_alive(&holder, now, stale_after) => {
                        Err(LockError::Busy {
                            pid: holder.pid,
                            acquired_at: holder.acquired_at,
                        })
                    }
                    holder => {
                        warn!(
                            path = %path.display(),
                            stale_pid = holder.as_ref().map(|h| h.pid),
                            "reclaiming dispatch lock from dead holder"
                        );
                        match std::fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => {
                                return Err(LockError::Io {
                                    path: path.clone(),
                                    source: e,
                                })
                            }
                        }
                        // One retry; losing the race now means a live
                        // contender got there first.
                        Self::try_create(&path, now)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Exclusive-create the lock file with this process as holder.
    fn try_create(path: &Path, now: DateTime<Utc>) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        let holder = Holder {
            pid: std::process::id(),
            acquired_at: now,
        };
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        match options.open(path) {
            Ok(file) => {
                // A holder record that fails to serialize is unreachable
                // (plain pid + timestamp), but do not hold a lock we
                // cannot attribute.
                serde_json::to_writer(&file, &holder).map_err(|e| LockError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::other(e),
                })?;
                debug!(path = %path.display(), pid = holder.pid, "dispatch lock acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LockError::Busy {
                pid: 0,
                acquired_at: now,
            }),
            Err(e) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Read the holder record; `None` if unreadable or malformed (a
    /// malformed lock is treated as dead and reclaimed).
    fn read_holder(path: &Path) -> Option<Holder> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Release the lock explicitly.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove dispatch lock");
            }
        } else {
            debug!(path = %self.path.display(), "dispatch lock released");
        }
    }
}

impl Drop for DispatchLock {
    fn drop(&mut self) {
        self.remove();
    }
}
