//! Per-working-directory mutual exclusion.
//!
//! A sync followed by a script run must own its working directory for the
//! whole sequence.  Locks are keyed by the resolved directory path and live
//! only while someone holds or waits for them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

type LockMap = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

#[derive(Clone, Default)]
pub struct WorkDirLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Exclusive hold on one working directory.  Released on drop.
pub struct WorkDirGuard {
    dir: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: WorkDirLocks,
}

impl WorkDirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(dir.to_path_buf()).or_default())
    }

    /// Take the lock for `dir` if nobody holds it.
    pub fn try_acquire(&self, dir: &Path) -> Option<WorkDirGuard> {
        let lock = self.entry(dir);
        match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => Some(self.guard(dir, lock, guard)),
            Err(_) => {
                self.prune(dir, &lock);
                None
            }
        }
    }

    /// Wait until the lock for `dir` is free and take it.
    pub async fn acquire(&self, dir: &Path) -> WorkDirGuard {
        let lock = self.entry(dir);
        let guard = Arc::clone(&lock).lock_owned().await;
        self.guard(dir, lock, guard)
    }

    /// Number of directories with a live lock entry.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn guard(
        &self,
        dir: &Path,
        lock: Arc<tokio::sync::Mutex<()>>,
        guard: OwnedMutexGuard<()>,
    ) -> WorkDirGuard {
        debug!(dir = %dir.display(), "working directory locked");
        WorkDirGuard {
            dir: dir.to_path_buf(),
            lock,
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Drop the map entry when only the map and `lock` still reference it.
    fn prune(&self, dir: &Path, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(dir) {
            if Arc::ptr_eq(existing, lock) && Arc::strong_count(existing) == 2 {
                map.remove(dir);
            }
        }
    }
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.prune(&self.dir, &self.lock);
        debug!(dir = %self.dir.display(), "working directory unlocked");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn second_holder_waits() {
        let locks = WorkDirLocks::new();
        let dir = Path::new("/srv/acme_widgets");

        let first = locks.acquire(dir).await;
        assert!(locks.try_acquire(dir).is_none());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(Path::new("/srv/acme_widgets")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        drop(second);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_dirs_do_not_contend() {
        let locks = WorkDirLocks::new();
        let _a = locks.acquire(Path::new("/srv/a")).await;
        assert!(locks.try_acquire(Path::new("/srv/b")).is_some());
    }

    #[test]
    fn entries_are_pruned_after_release() {
        let locks = WorkDirLocks::new();
        let guard = locks.try_acquire(Path::new("/srv/a")).unwrap();
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert_eq!(locks.len(), 0);
    }
}
