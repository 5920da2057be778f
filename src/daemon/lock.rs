//! Single-instance guard for the daemon: an exclusive, non-blocking `flock`.
//!
//! The lock is held for the daemon's whole lifetime and released when the
//! guard drops (or the process dies, since the kernel drops it with the fd).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::error::DaemonError;

pub struct DaemonLock {
    lock: Flock<File>,
    path: PathBuf,
}

impl DaemonLock {
    /// Take the lock or fail with [`DaemonError::AlreadyRunning`].
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Acquired {}", path.display());
                Ok(Self {
                    lock,
                    path: path.to_path_buf(),
                })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(DaemonError::AlreadyRunning(path.display().to_string()))
            }
            Err((_, errno)) => Err(DaemonError::Io(std::io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        let path = self.path;
        match self.lock.unlock() {
            Ok(_) => debug!("Released {}", path.display()),
            Err((_, e)) => warn!("Failed to release {}: {e}", path.display()),
        }
    }
}

/// Remove the PID file only when it still names `pid`.
pub fn remove_pid_file_if_owned(path: &Path, pid: u32) {
    if crate::paths::read_pid(path) != Some(pid) {
        return;
    }
    if let Err(e) = crate::paths::remove_if_exists(path) {
        warn!("Failed to remove {}: {e}", path.display());
    }
}
