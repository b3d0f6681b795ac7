use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Per-path advisory locks.
///
/// Two paths conflict when one is an ancestor of (or equal to) the other, so a
/// delete of `a/` and a rename of `a/x` are serialized while `a/` and `b/` run
/// concurrently.
#[derive(Debug, Default)]
pub struct PathLocks {
    held: Mutex<Vec<PathBuf>>,
    released: Condvar,
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

impl PathLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn held(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_free(held: &[PathBuf], paths: &[PathBuf]) -> bool {
        paths.iter().all(|p| held.iter().all(|h| !overlaps(p, h)))
    }

    /// Block until every path is free, then take them all at once
    pub fn lock(self: &Arc<Self>, paths: &[&Path]) -> PathLockGuard {
        let wanted: Vec<PathBuf> = paths.iter().map(|p| p.to_path_buf()).collect();
        let mut held = self.held();
        while !Self::is_free(&held, &wanted) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.extend(wanted.iter().cloned());
        PathLockGuard { locks: Arc::clone(self), paths: wanted }
    }

    /// Take every path now or none of them
    pub fn try_lock(self: &Arc<Self>, paths: &[&Path]) -> Option<PathLockGuard> {
        let wanted: Vec<PathBuf> = paths.iter().map(|p| p.to_path_buf()).collect();
        let mut held = self.held();
        if !Self::is_free(&held, &wanted) {
            return None;
        }
        held.extend(wanted.iter().cloned());
        Some(PathLockGuard { locks: Arc::clone(self), paths: wanted })
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.held().iter().any(|h| overlaps(h, path))
    }
}

/// Releases its paths on drop
#[derive(Debug)]
pub struct PathLockGuard {
    locks: Arc<PathLocks>,
    paths: Vec<PathBuf>,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held();
        for path in &self.paths {
            if let Some(pos) = held.iter().position(|h| h == path) {
                held.swap_remove(pos);
            }
        }
        drop(held);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_disjoint_paths_do_not_block() {
        let locks = PathLocks::new();
        let _a = locks.lock(&[Path::new("/s/a")]);
        assert!(locks.try_lock(&[Path::new("/s/b")]).is_some());
    }

    #[test]
    fn test_nested_paths_conflict() {
        let locks = PathLocks::new();
        let guard = locks.lock(&[Path::new("/s/a")]);
        assert!(locks.try_lock(&[Path::new("/s/a/x")]).is_none());
        assert!(locks.try_lock(&[Path::new("/s")]).is_none());
        assert!(locks.is_locked(Path::new("/s/a/x")));
        drop(guard);
        assert!(locks.try_lock(&[Path::new("/s/a/x")]).is_some());
    }

    #[test]
    fn test_try_lock_is_all_or_nothing() {
        let locks = PathLocks::new();
        let _a = locks.lock(&[Path::new("/s/a")]);
        assert!(locks.try_lock(&[Path::new("/s/b"), Path::new("/s/a")]).is_none());
        assert!(!locks.is_locked(Path::new("/s/b")));
    }

    #[test]
    fn test_lock_waits_for_release() {
        let locks = PathLocks::new();
        let guard = locks.lock(&[Path::new("/s/a")]);
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let locks = Arc::clone(&locks);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _g = locks.lock(&[Path::new("/s/a")]);
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
