//! Two-layer advisory workspace lock.
//!
//! Mutations are writer-exclusive per workspace. The lock stacks two layers:
//!
//! 1. **Intra-process**: a process-global registry `path → slot` serializes
//!    threads of this process before any OS primitive is touched.
//! 2. **Inter-process**: the lockfile is exclusive-created with a JSON body
//!    `{pid, hostname, acquired_at}`, then held under a kernel-level
//!    exclusive lock (`fs2`, flock/LockFileEx).
//!
//! A lockfile recorded by a nonexistent PID on the same host is stale. It is
//! reclaimed only after a 5-second grace period and a re-check that it is
//! still stale, so a holder that is merely slow to flock is never evicted.
//!
//! Acquisition across multiple paths must happen in sorted-absolute-path
//! order ([`acquire_many`]) to prevent deadlock. The returned guard releases
//! both layers on every exit path.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::MemError;

/// Hard ceiling on lock acquisition.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period before a stale lockfile may be reclaimed.
pub const STALE_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process-global set of lock paths currently held by this process.
static HELD: Lazy<DashMap<PathBuf, ()>> = Lazy::new(DashMap::new);

#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
}

impl LockBody {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: Utc::now(),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Liveness check by PID. Where `/proc` is unavailable the holder is assumed
/// alive, so reclamation never fires on such hosts.
fn pid_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.is_dir() {
        proc_root.join(pid.to_string()).exists()
    } else {
        true
    }
}

/// A held workspace lock. Dropping the guard releases the kernel lock,
/// removes the lockfile, and frees the intra-process slot.
pub struct LockGuard {
    file: Option<fs::File>,
    lock_path: PathBuf,
}

impl LockGuard {
    /// Path of the lockfile backing this guard.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(path = %self.lock_path.display(), "releasing workspace lock");
        if let Some(file) = self.file.take() {
            if let Err(err) = FileExt::unlock(&file) {
                warn!(path = %self.lock_path.display(), %err, "failed to unlock lockfile");
            }
        }
        if let Err(err) = fs::remove_file(&self.lock_path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), %err, "failed to remove lockfile");
            }
        }
        HELD.remove(&self.lock_path);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Acquire the lock at `lock_path`, blocking up to `timeout`.
pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<LockGuard, MemError> {
    let deadline = Instant::now() + timeout;
    let lock_path = lock_path.to_path_buf();

    // Layer 1: intra-process slot.
    loop {
        match HELD.entry(lock_path.clone()) {
            dashmap::Entry::Vacant(slot) => {
                slot.insert(());
                break;
            }
            dashmap::Entry::Occupied(_) => {
                if Instant::now() >= deadline {
                    return Err(MemError::LockTimeout(timeout));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    // Layer 2: lockfile + kernel lock. On any failure the slot is freed.
    match acquire_file(&lock_path, deadline) {
        Ok(file) => {
            info!(path = %lock_path.display(), "acquired workspace lock");
            Ok(LockGuard {
                file: Some(file),
                lock_path,
            })
        }
        Err(err) => {
            HELD.remove(&lock_path);
            if matches!(err, MemError::LockTimeout(_)) {
                Err(MemError::LockTimeout(timeout))
            } else {
                Err(err)
            }
        }
    }
}

fn acquire_file(lock_path: &Path, deadline: Instant) -> Result<fs::File, MemError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut stale_since: Option<Instant> = None;

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                let body = serde_json::to_vec_pretty(&LockBody::current())?;
                file.write_all(&body)?;
                file.sync_all()?;
                match FileExt::try_lock_exclusive(&file) {
                    Ok(()) => return Ok(file),
                    Err(err) => {
                        // Another process slipped a kernel lock onto our
                        // fresh file; back out and retry.
                        let _ = fs::remove_file(lock_path);
                        if err.kind() != ErrorKind::WouldBlock {
                            return Err(err.into());
                        }
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if lockfile_is_stale(lock_path) {
                    let first_seen = *stale_since.get_or_insert_with(Instant::now);
                    if first_seen.elapsed() >= STALE_GRACE && lockfile_is_stale(lock_path) {
                        warn!(path = %lock_path.display(), "reclaiming stale lockfile");
                        let _ = fs::remove_file(lock_path);
                        stale_since = None;
                        continue;
                    }
                } else {
                    stale_since = None;
                }
            }
            Err(err) => return Err(err.into()),
        }

        if Instant::now() >= deadline {
            return Err(MemError::LockTimeout(Duration::ZERO));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// A lockfile is stale when its recorded holder is a dead PID on this host.
fn lockfile_is_stale(lock_path: &Path) -> bool {
    let Ok(bytes) = fs::read(lock_path) else {
        // Vanished since the failed create; not stale, just gone.
        return false;
    };
    let Ok(body) = serde_json::from_slice::<LockBody>(&bytes) else {
        // Unreadable body: treat a half-written lockfile as stale so a
        // holder that crashed mid-create does not wedge the workspace.
        return true;
    };
    body.hostname == local_hostname() && body.pid != std::process::id() && !pid_alive(body.pid)
}

/// Acquire several locks in sorted-absolute-path order, all within one
/// deadline. Used when a mutation spans more than one locked resource.
pub fn acquire_many(paths: &[PathBuf], timeout: Duration) -> Result<Vec<LockGuard>, MemError> {
    let deadline = Instant::now() + timeout;
    let mut sorted: Vec<PathBuf> = paths.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut guards = Vec::with_capacity(sorted.len());
    for path in sorted {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MemError::LockTimeout(timeout));
        }
        guards.push(acquire(&path, remaining)?);
    }
    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock_path = dir.path().join(".mem-os.lock");

        let guard = acquire(&lock_path, Duration::from_secs(1)).unwrap();
        assert!(guard.lock_path().exists());
        drop(guard);

        assert!(!lock_path.exists());
        let _again = acquire(&lock_path, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_lock_body_recorded() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock_path = dir.path().join(".mem-os.lock");
        let _guard = acquire(&lock_path, Duration::from_secs(1)).unwrap();

        let body: LockBody =
            serde_json::from_slice(&fs::read(&lock_path).unwrap()).unwrap();
        assert_eq!(body.pid, std::process::id());
    }

    #[test]
    fn test_intra_process_contention_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock_path = dir.path().join(".mem-os.lock");
        let _guard = acquire(&lock_path, Duration::from_secs(1)).unwrap();

        let second = acquire(&lock_path, Duration::from_millis(150));
        assert!(matches!(second, Err(MemError::LockTimeout(_))));
    }

    #[test]
    fn test_threads_serialize() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock_path = dir.path().join(".mem-os.lock");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = lock_path.clone();
            handles.push(std::thread::spawn(move || {
                let _guard = acquire(&path, Duration::from_secs(5)).unwrap();
                std::thread::sleep(Duration::from_millis(20));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_live_foreign_lockfile_not_reclaimed_early() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock_path = dir.path().join(".mem-os.lock");

        // A lockfile held by our own live process id is never stale.
        let body = LockBody::current();
        fs::write(&lock_path, serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(!lockfile_is_stale(&lock_path));

        let result = acquire(&lock_path, Duration::from_millis(200));
        assert!(matches!(result, Err(MemError::LockTimeout(_))));
        fs::remove_file(&lock_path).unwrap();
    }

    #[test]
    fn test_stale_lock_reclaimed_after_grace() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock_path = dir.path().join(".mem-os.lock");

        // Forge a lockfile owned by a dead pid on this host. Pid 1 cannot be
        // used because it always exists; u32::MAX is effectively never live.
        let body = LockBody {
            pid: u32::MAX - 1,
            hostname: local_hostname(),
            acquired_at: Utc::now(),
        };
        fs::write(&lock_path, serde_json::to_vec(&body).unwrap()).unwrap();

        if !pid_alive(u32::MAX - 1) {
            let started = Instant::now();
            let guard = acquire(&lock_path, Duration::from_secs(10)).unwrap();
            // Reclamation must not happen before the 5 s grace re-check.
            assert!(started.elapsed() >= STALE_GRACE);
            drop(guard);
        }
    }

    #[test]
    fn test_acquire_many_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = vec![
            dir.path().join("b.lock"),
            dir.path().join("a.lock"),
            dir.path().join("a.lock"),
        ];
        let guards = acquire_many(&paths, Duration::from_secs(1)).unwrap();
        assert_eq!(guards.len(), 2);
        assert!(guards[0].lock_path().ends_with("a.lock"));
    }
}
