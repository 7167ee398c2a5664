//! Advisory pid lock backing the single-instance gate.

use crate::error::{Error, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// An exclusive flock on a pid file. The owner pid is written as ASCII
/// decimal so other processes can identify the holder.
pub struct PidLock {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl PidLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock without blocking, then records our pid.
    ///
    /// The file is not truncated before the lock is held, so a failed
    /// attempt never clobbers a live owner's pid.
    pub fn try_lock(&mut self) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)
            .map_err(Error::PidFileCreate)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) => return Err(Error::PidFileLock(errno)),
        };

        lock.set_len(0).map_err(Error::PidFileWrite)?;
        write!(&mut *lock, "{}", std::process::id()).map_err(Error::PidFileWrite)?;
        lock.flush().map_err(Error::PidFileWrite)?;

        self.lock = Some(lock);
        Ok(())
    }

    /// Reads the pid recorded in the lock file.
    pub fn owner(&self) -> Result<i32> {
        let content = std::fs::read_to_string(&self.path)?;
        content
            .trim()
            .parse::<i32>()
            .map_err(|e| Error::InvalidConfig(format!("pid file content: {e}")))
    }

    /// Releases the lock and removes the file. Failures are logged, not
    /// fatal; unlock on an unheld lock is a no-op.
    pub fn unlock(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };

        if let Err((_, errno)) = lock.unlock() {
            tracing::warn!("unlock pid file failed: {errno}");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("remove pid file failed: {e}");
        }
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
