//! Exclusive run lock on the data directory.
//!
//! Overlapping scheduler triggers must not fetch and persist at the same
//! time. The lock is an advisory `flock`-style lock on `data_dir/.run.lock`;
//! the OS drops it if the process dies.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info};

/// Lock file name inside the data directory.
pub const LOCK_FILE: &str = ".run.lock";

/// Poll interval while waiting for another run to finish.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the duration of fetching and persisting. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` when another holder kept it for the whole wait.
    pub async fn acquire(dir: &Path, wait: Duration) -> io::Result<Option<RunLock>> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        // A wait too long to represent has no deadline.
        let deadline = tokio::time::Instant::now().checked_add(wait);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                        info!(lock = %path.display(), waited_ms = wait.as_millis() as u64, "run lock held elsewhere");
                        return Ok(None);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }

        // Holder pid is informational only.
        let _ = file.set_len(0);
        let _ = writeln!(file, "pid={}", std::process::id());
        let _ = file.flush();

        debug!(lock = %path.display(), "run lock acquired");
        Ok(Some(RunLock { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(lock = %self.path.display(), error = %e, "run lock unlock failed");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
