//! Single-instance run lock
//!
//! The lock is a JSON marker file created with `create_new`, so two processes
//! racing for it cannot both win. A marker is reclaimable when its owner
//! process is gone or when its last heartbeat is older than the staleness
//! window. The owner rewrites the heartbeat while it works, so a long cycle
//! never looks stale to a second instance.

use crate::storage::write_json;
use crate::{Result, TomeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Liveness check for the owner of a lock marker
pub trait LivenessCheck: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// [`LivenessCheck`] backed by `sysinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoLiveness;

impl LivenessCheck for SysinfoLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

/// Contents of `run.lock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl LockMarker {
    fn current() -> Self {
        let now = Utc::now();
        Self {
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: now,
            heartbeat_at: Some(now),
        }
    }

    /// Most recent sign of life from the owner
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeat_at.unwrap_or(self.acquired_at)
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.last_seen()).to_std().unwrap_or_default()
    }

    /// Same acquisition, ignoring heartbeats
    fn same_owner(&self, other: &LockMarker) -> bool {
        self.pid == other.pid && self.hostname == other.hostname && self.acquired_at == other.acquired_at
    }
}

/// Result of one acquisition attempt
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(RunLockGuard),
    /// A live owner holds the lock; nothing was changed
    Contended { pid: u32, since: DateTime<Utc> },
}

/// Exclusive marker guarding one dataset against concurrent drivers
pub struct RunLock {
    path: PathBuf,
    stale_after: Duration,
    liveness: Arc<dyn LivenessCheck>,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration, liveness: Arc<dyn LivenessCheck>) -> Self {
        Self {
            path: path.into(),
            stale_after,
            liveness,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How often a holder should call [`RunLockGuard::heartbeat`]
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_after / 4).max(Duration::from_millis(100))
    }

    /// Tries once to take the lock, reclaiming a dead or stale marker
    ///
    /// The file work and the process lookup run on the blocking pool.
    pub async fn try_acquire(&self) -> Result<LockAttempt> {
        let path = self.path.clone();
        let stale_after = self.stale_after;
        let liveness = Arc::clone(&self.liveness);
        tokio::task::spawn_blocking(move || acquire(&path, stale_after, liveness.as_ref()))
            .await
            .map_err(|e| TomeError::Lock(format!("lock task failed: {}", e)))?
    }
}

fn acquire(path: &Path, stale_after: Duration, liveness: &dyn LivenessCheck) -> Result<LockAttempt> {
    // Second round only happens after reclaiming a marker
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let marker = LockMarker::current();
                let json = serde_json::to_vec_pretty(&marker)
                    .map_err(|e| TomeError::Lock(format!("cannot encode marker: {}", e)))?;
                file.write_all(&json)?;
                file.sync_all()?;
                tracing::debug!("Run lock acquired at {}", path.display());
                return Ok(LockAttempt::Acquired(RunLockGuard {
                    path: path.to_path_buf(),
                    marker,
                    released: false,
                }));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_marker(path)? {
                Some(existing) => {
                    let Some(reason) = reclaim_reason(&existing, stale_after, liveness) else {
                        return Ok(LockAttempt::Contended {
                            pid: existing.pid,
                            since: existing.acquired_at,
                        });
                    };
                    tracing::warn!(
                        "Reclaiming run lock of pid {} ({}), last seen {}",
                        existing.pid,
                        reason,
                        existing.last_seen()
                    );
                    remove_marker(path)?;
                }
                None => {
                    tracing::warn!("Run lock marker is unreadable, reclaiming");
                    remove_marker(path)?;
                }
            },
            Err(e) => return Err(e.into()),
        }
    }

    Err(TomeError::Lock(format!(
        "lost the race for {} twice",
        path.display()
    )))
}

fn reclaim_reason(
    marker: &LockMarker,
    stale_after: Duration,
    liveness: &dyn LivenessCheck,
) -> Option<&'static str> {
    if marker.age() > stale_after {
        return Some("stale");
    }
    // Liveness is only meaningful for a pid on this host
    if marker.hostname == local_hostname() && !liveness.is_alive(marker.pid) {
        return Some("owner is dead");
    }
    None
}

/// Held run lock; removed on [`RunLockGuard::release`] or drop
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    marker: LockMarker,
    released: bool,
}

impl RunLockGuard {
    pub fn marker(&self) -> &LockMarker {
        &self.marker
    }

    /// Refreshes the marker's heartbeat
    ///
    /// Returns `false` and writes nothing when the marker no longer belongs
    /// to this guard.
    pub async fn heartbeat(&mut self) -> Result<bool> {
        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str::<LockMarker>(&text).ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match current {
            Some(current) if current.same_owner(&self.marker) => {
                let mut marker = self.marker.clone();
                marker.heartbeat_at = Some(Utc::now());
                write_json(&self.path, &marker).await?;
                self.marker = marker;
                Ok(true)
            }
            _ => {
                tracing::warn!("Run lock at {} is no longer ours", self.path.display());
                Ok(false)
            }
        }
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let path = self.path.clone();
        let marker = self.marker.clone();
        tokio::task::spawn_blocking(move || remove_if_owned(&path, &marker))
            .await
            .map_err(|e| TomeError::Lock(format!("lock task failed: {}", e)))?
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_if_owned(&self.path, &self.marker) {
            tracing::warn!("Failed to release run lock: {}", e);
        }
    }
}

/// Removes the marker only while it still belongs to `ours`
fn remove_if_owned(path: &Path, ours: &LockMarker) -> Result<()> {
    match read_marker(path)? {
        Some(current) if current.same_owner(ours) => {
            remove_marker(path)?;
            tracing::debug!("Run lock released");
        }
        Some(current) => {
            tracing::warn!(
                "Run lock now belongs to pid {}, leaving it in place",
                current.pid
            );
        }
        None => {}
    }
    Ok(())
}

/// Reads a marker; `None` when missing or undecodable
fn read_marker(path: &Path) -> Result<Option<LockMarker>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text).ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_marker(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn local_hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedLiveness(bool);

    impl LivenessCheck for FixedLiveness {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn lock_with(dir: &TempDir, alive: bool, stale_after: Duration) -> RunLock {
        RunLock::new(dir.path().join("run.lock"), stale_after, Arc::new(FixedLiveness(alive)))
    }

    fn lock(dir: &TempDir, alive: bool) -> RunLock {
        lock_with(dir, alive, Duration::from_secs(3600))
    }

    fn plant(dir: &TempDir, pid: u32, acquired_at: DateTime<Utc>) -> String {
        let marker = LockMarker {
            pid,
            hostname: local_hostname(),
            acquired_at,
            heartbeat_at: None,
        };
        let text = serde_json::to_string(&marker).unwrap();
        std::fs::write(dir.path().join("run.lock"), &text).unwrap();
        text
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, true);

        let LockAttempt::Acquired(guard) = lock.try_acquire().await.unwrap() else {
            panic!("expected to acquire a free lock");
        };
        assert_eq!(guard.marker().pid, std::process::id());
        assert!(lock.path().exists());

        guard.release().await.unwrap();
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn test_second_acquire_is_contended() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, true);

        let _held = lock.try_acquire().await.unwrap();
        match lock.try_acquire().await.unwrap() {
            LockAttempt::Contended { pid, .. } => assert_eq!(pid, std::process::id()),
            LockAttempt::Acquired(_) => panic!("lock acquired twice"),
        }
    }

    #[tokio::test]
    async fn test_dead_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        plant(&dir, 999_999, Utc::now());

        let attempt = lock(&dir, false).try_acquire().await.unwrap();
        let LockAttempt::Acquired(guard) = attempt else {
            panic!("dead owner should be reclaimed");
        };
        assert_eq!(guard.marker().pid, std::process::id());

        let on_disk = read_marker(&dir.path().join("run.lock")).unwrap().unwrap();
        assert_eq!(&on_disk, guard.marker());
    }

    #[tokio::test]
    async fn test_live_owner_leaves_marker_untouched() {
        let dir = TempDir::new().unwrap();
        let planted = plant(&dir, 4242, Utc::now());

        let attempt = lock(&dir, true).try_acquire().await.unwrap();
        assert!(matches!(attempt, LockAttempt::Contended { pid: 4242, .. }));

        let after = std::fs::read_to_string(dir.path().join("run.lock")).unwrap();
        assert_eq!(after, planted);
    }

    #[tokio::test]
    async fn test_stale_marker_is_reclaimed_even_if_alive() {
        let dir = TempDir::new().unwrap();
        plant(&dir, 4242, Utc::now() - chrono::Duration::hours(2));

        let attempt = lock(&dir, true).try_acquire().await.unwrap();
        assert!(matches!(attempt, LockAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_live_owner_fresh() {
        let dir = TempDir::new().unwrap();
        let stale_after = Duration::from_millis(300);
        let first = lock_with(&dir, true, stale_after);
        let LockAttempt::Acquired(mut guard) = first.try_acquire().await.unwrap() else {
            panic!("expected to acquire a free lock");
        };

        for _ in 0..4 {
            tokio::time::sleep(first.heartbeat_interval()).await;
            assert!(guard.heartbeat().await.unwrap());
        }

        let second = lock_with(&dir, true, stale_after);
        let attempt = second.try_acquire().await.unwrap();
        assert!(matches!(attempt, LockAttempt::Contended { .. }));

        let on_disk = read_marker(first.path()).unwrap().unwrap();
        assert!(on_disk.last_seen() > guard.marker().acquired_at);
        guard.release().await.unwrap();
        assert!(!first.path().exists());
    }

    #[tokio::test]
    async fn test_heartbeat_leaves_foreign_marker() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, true);
        let LockAttempt::Acquired(mut guard) = lock.try_acquire().await.unwrap() else {
            panic!("expected to acquire a free lock");
        };

        let planted = plant(&dir, 4242, Utc::now());
        assert!(!guard.heartbeat().await.unwrap());
        assert_eq!(std::fs::read_to_string(lock.path()).unwrap(), planted);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, true);
        {
            let _attempt = lock.try_acquire().await.unwrap();
        }
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn test_release_keeps_foreign_marker() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, true);
        let LockAttempt::Acquired(guard) = lock.try_acquire().await.unwrap() else {
            panic!("expected to acquire a free lock");
        };

        let planted = plant(&dir, 4242, Utc::now());
        guard.release().await.unwrap();

        let after = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(after, planted);
    }
}
