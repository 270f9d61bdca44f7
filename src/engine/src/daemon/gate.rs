//! Process- and host-wide daemon mutual exclusion.
//!
//! File locks alone are not enough: they are recursive, so a second
//! thread in the same process would re-acquire a lock its sibling already
//! holds. The gate therefore layers an in-process mutex under a lock file
//! in the system temporary directory. The mutex is always taken first and
//! released last; the file lock is retried on contention with a fixed
//! backoff and surfaces non-transient errors immediately.
//!
//! The gate covers only exclusive daemon operations (load image, record
//! tag). Container runs happen outside the gate.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use fs4::fs_std::FileExt;
use shale_core::error::{Result, ShaleError};

/// Attempts before giving up on a contended lock file.
const LOCK_TRIES: u32 = 10;

/// Fixed delay between lock file attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Well-known lock file name under the system temp directory, shared by
/// every process on the host.
const LOCK_FILE_NAME: &str = ".shale.lock";

static PROCESS_MUTEX: Mutex<()> = Mutex::new(());

/// The two-level daemon gate.
#[derive(Debug, Clone)]
pub struct DaemonGate {
    lock_path: PathBuf,
    tries: u32,
    retry_delay: Duration,
}

impl Default for DaemonGate {
    fn default() -> Self {
        Self {
            lock_path: std::env::temp_dir().join(LOCK_FILE_NAME),
            tries: LOCK_TRIES,
            retry_delay: LOCK_RETRY_DELAY,
        }
    }
}

impl DaemonGate {
    /// Gate using the well-known host-wide lock path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate with a custom lock path and retry schedule. Test hook.
    pub fn with_lock_path(lock_path: impl Into<PathBuf>, tries: u32, retry_delay: Duration) -> Self {
        Self {
            lock_path: lock_path.into(),
            tries: tries.max(1),
            retry_delay,
        }
    }

    /// Acquire the gate: in-process mutex first, then the file lock.
    ///
    /// Blocks on the mutex; retries the file lock up to the configured
    /// number of attempts. The returned guard releases in reverse order
    /// when dropped.
    pub fn acquire(&self) -> Result<GateGuard> {
        let process = PROCESS_MUTEX
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                ShaleError::Lock(format!(
                    "cannot open lock file {}: {}",
                    self.lock_path.display(),
                    e
                ))
            })?;

        for attempt in 1..=self.tries {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(path = %self.lock_path.display(), "Daemon gate acquired");
                    return Ok(GateGuard {
                        file: Some(file),
                        _process: process,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tracing::debug!(
                        attempt,
                        "Daemon gate busy, retrying after {:?}",
                        self.retry_delay
                    );
                    if attempt < self.tries {
                        std::thread::sleep(self.retry_delay);
                    }
                }
                Err(e) => {
                    // Non-transient: surface immediately. The mutex guard
                    // drops here, preserving release order.
                    return Err(ShaleError::Lock(format!(
                        "cannot acquire lock file {}: {}",
                        self.lock_path.display(),
                        e
                    )));
                }
            }
        }

        Err(ShaleError::Lock(format!(
            "lock file {} still busy after {} attempts",
            self.lock_path.display(),
            self.tries
        )))
    }
}

/// Holds both levels of the gate; released on drop, file lock first.
#[derive(Debug)]
pub struct GateGuard {
    file: Option<File>,
    _process: MutexGuard<'static, ()>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!(error = %e, "Failed to release daemon gate lock file");
            }
        }
        // The in-process mutex guard drops after this body runs.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fast_gate(dir: &TempDir) -> DaemonGate {
        DaemonGate::with_lock_path(
            dir.path().join("gate.lock"),
            3,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_acquire_release() {
        let tmp = TempDir::new().unwrap();
        let gate = fast_gate(&tmp);

        let guard = gate.acquire().unwrap();
        drop(guard);

        // Re-acquirable after release
        let guard = gate.acquire().unwrap();
        drop(guard);
    }

    #[test]
    fn test_file_lock_held_while_guarded() {
        let tmp = TempDir::new().unwrap();
        let gate = fast_gate(&tmp);

        let guard = gate.acquire().unwrap();

        // A raw second handle cannot take the file lock while the guard
        // lives.
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .open(tmp.path().join("gate.lock"))
            .unwrap();
        assert!(raw.try_lock_exclusive().is_err());

        drop(guard);
        assert!(raw.try_lock_exclusive().is_ok());
        FileExt::unlock(&raw).unwrap();
    }

    #[test]
    fn test_gate_exclusivity_under_contention() {
        let tmp = TempDir::new().unwrap();
        let gate = Arc::new(DaemonGate::with_lock_path(
            tmp.path().join("gate.lock"),
            200,
            Duration::from_millis(1),
        ));

        let holders = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let holders = Arc::clone(&holders);
            let max_seen = Arc::clone(&max_seen);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    let guard = gate.acquire().unwrap();
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(200));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
