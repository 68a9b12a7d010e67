//! Single-instance guard keyed by a pid lock file.
//!
//! The lock file holds the decimal pid of the current holder. A holder that no
//! longer answers a zero-signal probe is stale and its lock is reclaimed. A live
//! holder is fatal for the caller. The lock records no hostname, so two hosts
//! sharing one lock path over a network volume are not detected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::atomic_io::write_text_atomic;

/// Answers whether a process id currently belongs to a live process.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_alive(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// Probes liveness with `kill(pid, 0)`; no signal is delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalLivenessProbe;

impl LivenessProbe for SignalLivenessProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to another user.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum SessionGuardError {
    #[error("another instance is already running (pid {pid} holds {})", .path.display())]
    DuplicateInstance { pid: u32, path: PathBuf },
    #[error("session lock I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write session lock {}: {detail}", .path.display())]
    Write { path: PathBuf, detail: String },
}

/// Handle for a held lock. Dropping it leaves the file in place; the next
/// `acquire` detects the dead holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLock {
    path: PathBuf,
    pid: u32,
}

impl SessionLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Removes the lock file if it still names this holder.
    pub fn release(self) {
        match read_holder_pid(&self.path) {
            Ok(Some(holder)) if holder == self.pid => {
                if let Err(error) = std::fs::remove_file(&self.path) {
                    warn!(
                        path = %self.path.display(),
                        error = %error,
                        "session lock release failed"
                    );
                }
            }
            Ok(_) => debug!(path = %self.path.display(), "session lock no longer ours; leaving it"),
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "session lock release skipped")
            }
        }
    }
}

pub struct SessionGuard {
    probe: Arc<dyn LivenessProbe>,
    pid: u32,
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SignalLivenessProbe), std::process::id())
    }

    /// Guard acting as `pid`, probing other holders through `probe`.
    pub fn with_probe(probe: Arc<dyn LivenessProbe>, pid: u32) -> Self {
        Self { probe, pid }
    }

    pub fn acquire(&self, lock_path: &Path) -> Result<SessionLock, SessionGuardError> {
        match read_holder_pid(lock_path) {
            Ok(Some(holder)) if holder != self.pid && self.probe.is_alive(holder) => {
                return Err(SessionGuardError::DuplicateInstance {
                    pid: holder,
                    path: lock_path.to_path_buf(),
                });
            }
            Ok(Some(holder)) if holder != self.pid => {
                info!(
                    stale_pid = holder,
                    path = %lock_path.display(),
                    "reclaiming stale session lock"
                );
            }
            Ok(_) => {}
            Err(source) => {
                return Err(SessionGuardError::Io {
                    path: lock_path.to_path_buf(),
                    source,
                })
            }
        }

        write_text_atomic(lock_path, &self.pid.to_string()).map_err(|error| {
            SessionGuardError::Write {
                path: lock_path.to_path_buf(),
                detail: format!("{error:#}"),
            }
        })?;
        debug!(pid = self.pid, path = %lock_path.display(), "session lock acquired");
        Ok(SessionLock {
            path: lock_path.to_path_buf(),
            pid: self.pid,
        })
    }

    /// Like `acquire`, but prints the failure to stderr and exits with status 1.
    pub fn acquire_or_exit(&self, lock_path: &Path) -> SessionLock {
        match self.acquire(lock_path) {
            Ok(lock) => lock,
            Err(error) => {
                eprintln!("calbot: {error}");
                std::process::exit(1);
            }
        }
    }
}

/// Reads the holder pid. Missing file is `None`; unparseable content is
/// treated as stale and also reads as `None`.
pub fn read_holder_pid(lock_path: &Path) -> std::io::Result<Option<u32>> {
    let raw = match std::fs::read_to_string(lock_path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error),
    };
    match raw.trim().parse::<u32>() {
        Ok(pid) => Ok(Some(pid)),
        Err(_) => {
            warn!(
                path = %lock_path.display(),
                "session lock content is not a pid; treating as stale"
            );
            Ok(None)
        }
    }
}
