//! Advisory whole-file lockfile, coordinating with any other process exercising the same device.
//!
//! Grounded in `original_source/lockfile.c`'s `open_lockfile`/`lock_lockfile`/`unlock_lockfile`,
//! reimplemented over `nix::fcntl::flock` (a whole-file advisory lock, same contract as the
//! original's `lockf(..., 0)` calls with a zero length) instead of POSIX record locking.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum LockfileError {
    #[snafu(display("failed to open lockfile {}: {}", path.display(), source))]
    Open { path: PathBuf, source: io::Error },
    #[snafu(display("failed to acquire lock on {}: {}", path.display(), source))]
    Lock { path: PathBuf, source: nix::Error },
    #[snafu(display("failed to release lock on {}: {}", path.display(), source))]
    Unlock { path: PathBuf, source: nix::Error },
}

/// An open, exclusively-locked lockfile. Dropped (and thus unlocked and closed) at the end of the
/// speed-sensitive phase that acquired it.
pub struct Lockfile {
    file: File,
    path: PathBuf,
}

impl Lockfile {
    /// Opens (creating if absent) the lockfile at `path` without locking it yet.
    pub fn open(path: &Path) -> Result<Self, LockfileError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| LockfileError::Open { path: path.to_path_buf(), source })?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// `true` if another process currently holds the lock.
    pub fn is_locked_by_other(&self) -> bool {
        match flock(self.file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
                false
            }
            Err(_) => true,
        }
    }

    /// Acquires the exclusive lock, blocking until any other holder releases it.
    pub fn lock(&self) -> Result<(), LockfileError> {
        flock(self.file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|source| LockfileError::Lock { path: self.path.clone(), source })
    }

    /// Releases the lock, allowing another process (or the long-running endurance phase, which
    /// does not hold it) to proceed.
    pub fn unlock(&self) -> Result<(), LockfileError> {
        flock(self.file.as_raw_fd(), FlockArg::Unlock)
            .map_err(|source| LockfileError::Unlock { path: self.path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_then_unlock_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let lockfile = Lockfile::open(&path).unwrap();
        lockfile.lock().unwrap();
        lockfile.unlock().unwrap();
    }

    #[test]
    fn a_second_handle_sees_the_lock_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let first = Lockfile::open(&path).unwrap();
        let second = Lockfile::open(&path).unwrap();

        first.lock().unwrap();
        assert!(second.is_locked_by_other());

        first.unlock().unwrap();
        assert!(!second.is_locked_by_other());
    }
}
