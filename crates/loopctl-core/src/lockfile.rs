//! Per-user lockfile coordinator preventing parallel/nested engine runs
//! against the same or a containing/contained feature path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::atomic_io::write_atomic_str;

/// Liveness probe abstraction so the stale-lock sweep can be tested
/// without spawning real processes.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = sysinfo::System::new();
        system.refresh_processes();
        system.process(sysinfo::Pid::from_u32(pid)).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockContents {
    pid: u32,
    path: PathBuf,
    acquired_at: DateTime<Utc>,
}

impl LockContents {
    fn to_file_contents(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.pid,
            self.path.display(),
            self.acquired_at.to_rfc3339()
        )
    }

    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid: u32 = lines.next()?.trim().parse().ok()?;
        let path = PathBuf::from(lines.next()?.trim());
        let acquired_at = DateTime::parse_from_rfc3339(lines.next()?.trim())
            .ok()?
            .with_timezone(&Utc);
        Some(Self {
            pid,
            path,
            acquired_at,
        })
    }
}

/// A conflicting lock: surfaced by `acquire` so the run engine can report
/// the owning pid and path in its terminal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub pid: u32,
    pub path: PathBuf,
}

impl std::fmt::Display for LockConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "feature path is locked by pid {} at {}",
            self.pid,
            self.path.display()
        )
    }
}

impl std::error::Error for LockConflict {}

/// Reversible-in-spirit encoding of an absolute path into a lockfile
/// basename: slashes become double underscores.
fn encode_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "__")
        .replace('/', "__")
}

fn conflicts(existing: &Path, target: &Path) -> bool {
    existing == target || existing.starts_with(target) || target.starts_with(existing)
}

/// A held lock; dropping it best-effort removes the file. Callers that
/// want the checked (pid-verifying) release should call `release`
/// explicitly instead of relying on `Drop`.
pub struct LockHandle {
    file_path: PathBuf,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.file_path);
    }
}

pub struct LockfileCoordinator<P: ProcessProbe = SystemProcessProbe> {
    lockfiles_dir: PathBuf,
    probe: P,
}

impl LockfileCoordinator<SystemProcessProbe> {
    pub fn new(lockfiles_dir: impl Into<PathBuf>) -> Self {
        Self::with_probe(lockfiles_dir, SystemProcessProbe)
    }
}

impl<P: ProcessProbe> LockfileCoordinator<P> {
    pub fn with_probe(lockfiles_dir: impl Into<PathBuf>, probe: P) -> Self {
        Self {
            lockfiles_dir: lockfiles_dir.into(),
            probe,
        }
    }

    async fn sweep_stale(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.lockfiles_dir).await?;
        let mut entries = tokio::fs::read_dir(&self.lockfiles_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let Some(lock) = LockContents::parse(&contents) else {
                continue;
            };
            if !self.probe.is_alive(lock.pid) {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }

    /// Sweep stale locks, then reject `target` if any remaining lock's
    /// stored path equals, contains, or is contained by it.
    pub async fn acquire(&self, target: &Path) -> anyhow::Result<LockHandle> {
        self.sweep_stale().await?;

        let mut entries = tokio::fs::read_dir(&self.lockfiles_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let Some(lock) = LockContents::parse(&contents) else {
                continue;
            };
            if conflicts(&lock.path, target) {
                return Err(LockConflict {
                    pid: lock.pid,
                    path: lock.path,
                }
                .into());
            }
        }

        let file_name = encode_path(target);
        let file_path = self.lockfiles_dir.join(format!("{file_name}.lock"));
        let lock = LockContents {
            pid: std::process::id(),
            path: target.to_path_buf(),
            acquired_at: Utc::now(),
        };
        write_atomic_str(&file_path, &lock.to_file_contents()).await?;
        Ok(LockHandle { file_path })
    }

    /// Release the lock for `target` only if its stored pid matches the
    /// current process. Returns whether a lock was actually removed, for
    /// the `loopctl release-lock <path>` CLI command.
    pub async fn release(&self, target: &Path) -> anyhow::Result<bool> {
        let file_name = encode_path(target);
        let file_path = self.lockfiles_dir.join(format!("{file_name}.lock"));
        let Ok(contents) = tokio::fs::read_to_string(&file_path).await else {
            return Ok(false);
        };
        let Some(lock) = LockContents::parse(&contents) else {
            return Ok(false);
        };
        if lock.pid != std::process::id() {
            return Ok(false);
        }
        tokio::fs::remove_file(&file_path).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeProbe {
        alive: Mutex<HashSet<u32>>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    fn probe(alive_pids: &[u32]) -> FakeProbe {
        FakeProbe {
            alive: Mutex::new(alive_pids.iter().copied().collect()),
        }
    }

    #[tokio::test]
    async fn acquire_rejects_same_ancestor_and_descendant_paths() {
        let dir = tempdir().unwrap();
        let coordinator = LockfileCoordinator::with_probe(dir.path(), probe(&[std::process::id()]));
        let _held = coordinator.acquire(Path::new("/a/b")).await.unwrap();

        assert!(coordinator.acquire(Path::new("/a/b")).await.is_err());
        assert!(coordinator.acquire(Path::new("/a")).await.is_err());
        assert!(coordinator.acquire(Path::new("/a/b/c")).await.is_err());
    }

    #[tokio::test]
    async fn acquire_allows_sibling_paths() {
        let dir = tempdir().unwrap();
        let coordinator = LockfileCoordinator::with_probe(dir.path(), probe(&[std::process::id()]));
        let _held = coordinator.acquire(Path::new("/a/b")).await.unwrap();

        assert!(coordinator.acquire(Path::new("/a/b-sibling")).await.is_ok());
    }

    #[tokio::test]
    async fn stale_lock_from_dead_pid_is_swept() {
        let dir = tempdir().unwrap();
        let stale = LockContents {
            pid: 999_999,
            path: PathBuf::from("/a/b"),
            acquired_at: Utc::now(),
        };
        tokio::fs::write(
            dir.path().join("stale.lock"),
            stale.to_file_contents(),
        )
        .await
        .unwrap();

        let coordinator = LockfileCoordinator::with_probe(dir.path(), probe(&[]));
        let result = coordinator.acquire(Path::new("/a/b")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn release_only_removes_lock_owned_by_current_pid() {
        let dir = tempdir().unwrap();
        let coordinator = LockfileCoordinator::with_probe(dir.path(), probe(&[std::process::id()]));
        let held = coordinator.acquire(Path::new("/a/b")).await.unwrap();
        std::mem::forget(held);

        let removed = coordinator.release(Path::new("/a/b")).await.unwrap();
        assert!(removed);
        let removed_again = coordinator.release(Path::new("/a/b")).await.unwrap();
        assert!(!removed_again);
    }
}
