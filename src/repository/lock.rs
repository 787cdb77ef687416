//! Advisory file locks that can be upgraded from shared to exclusive

use crate::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct UpgradableLock {
    file: File,
    path: PathBuf,
    exclusive: bool,
    timeout: Duration,
}

impl UpgradableLock {
    pub fn acquire<P: AsRef<Path>>(path: P, exclusive: bool, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let lock = Self {
            file,
            path,
            exclusive,
            timeout,
        };
        lock.lock(exclusive)?;
        Ok(lock)
    }

    fn lock(&self, exclusive: bool) -> Result<()> {
        let arg = if exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        let deadline = Instant::now() + self.timeout;
        loop {
            match flock(self.file.as_raw_fd(), arg) {
                Ok(()) => {
                    debug!(path = %self.path.display(), exclusive, "lock acquired");
                    return Ok(());
                }
                Err(Errno::EWOULDBLOCK) if Instant::now() < deadline => thread::sleep(RETRY_INTERVAL),
                Err(Errno::EWOULDBLOCK) => {
                    return Err(Error::LockTimeout {
                        path: self.path.display().to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn upgrade(&mut self) -> Result<()> {
        if !self.exclusive {
            self.lock(true)?;
            self.exclusive = true;
        }
        Ok(())
    }
}

impl Drop for UpgradableLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shared_and_exclusive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config");
        std::fs::write(&path, b"")?;
        let wait = Duration::from_millis(100);

        let shared1 = UpgradableLock::acquire(&path, false, wait)?;
        let mut shared2 = UpgradableLock::acquire(&path, false, wait)?;
        assert!(matches!(
            UpgradableLock::acquire(&path, true, wait),
            Err(Error::LockTimeout { .. })
        ));
        assert!(shared2.upgrade().is_err());

        drop(shared1);
        shared2.upgrade()?;
        assert!(shared2.is_exclusive());
        assert!(UpgradableLock::acquire(&path, false, wait).is_err());
        drop(shared2);
        UpgradableLock::acquire(&path, true, wait)?;
        Ok(())
    }
}
