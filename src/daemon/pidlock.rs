//! Pid file doubling as the single-instance lock.
//!
//! The file is locked with a non-blocking exclusive `flock` for the whole
//! daemon lifetime and holds the decimal PID plus a newline. On release the
//! file is unlinked while still locked, so a competing daemon can't take a
//! lock on an inode that is about to disappear.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use super::DaemonError;

pub struct PidLock {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let lock_err = |source: std::io::Error| DaemonError::Lock {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(lock_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(lock_err)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(DaemonError::AlreadyRunning {
                    path: path.to_path_buf(),
                })
            }
            Err((_, errno)) => return Err(lock_err(errno.into())),
        };

        lock.set_len(0).map_err(lock_err)?;
        writeln!(lock, "{}", std::process::id()).map_err(lock_err)?;
        lock.sync_all().map_err(lock_err)?;
        debug!(path = %path.display(), "pid lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            lock: Some(lock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the pid file, then unlock and close it.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove pid file: {e}");
        }
        drop(lock);
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// PID recorded in `path`, if the file exists and holds one.
pub fn read_pid(path: &Path) -> Option<i32> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}
