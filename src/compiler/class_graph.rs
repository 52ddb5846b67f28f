//! Shared class-graph scan cache.
//!
//! Scanning a classpath for its symbols is expensive and the result is
//! identical for scopes that share a classpath, so scans live in a shared
//! cache and scopes hold reference-counted handles. The last release of a
//! handle disposes the underlying scan; `invalidate_entries_under_project`
//! evicts every scan that references build outputs under a project root
//! (those outputs just changed, so the symbols indexed from them are stale).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Opaque index of the symbols reachable through one classpath.
///
/// The orchestrator only manages its lifecycle; feature providers query its
/// contents downstream.
#[derive(Debug)]
pub struct ClassGraphScan {
    classpath: Vec<PathBuf>,
    disposed: AtomicBool,
}

impl ClassGraphScan {
    fn new(classpath: Vec<PathBuf>) -> Self {
        Self {
            classpath,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn references_outputs_under(&self, project_root: &Path) -> bool {
        self.classpath
            .iter()
            .any(|entry| entry.starts_with(project_root))
    }
}

struct ScanSlot {
    scan: Arc<ClassGraphScan>,
    refcount: usize,
}

struct ScanCacheInner {
    slots: DashMap<u64, ScanSlot>,
}

/// Reference-counted cache of classpath scans, shared across scopes.
pub struct ScanCache {
    inner: Arc<ScanCacheInner>,
}

/// A counted reference to a cached scan. Call [`ScanHandle::release`] when
/// the owning scope drops or replaces its classpath; dropping the handle
/// without an explicit release also releases it.
pub struct ScanHandle {
    key: u64,
    scan: Arc<ClassGraphScan>,
    cache: Arc<ScanCacheInner>,
    released: bool,
}

impl ScanHandle {
    pub fn scan(&self) -> &Arc<ClassGraphScan> {
        &self.scan
    }

    /// Decrements the refcount; the last release disposes the scan.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        use dashmap::mapref::entry::Entry;
        if let Entry::Occupied(mut slot) = self.cache.slots.entry(self.key) {
            slot.get_mut().refcount = slot.get().refcount.saturating_sub(1);
            if slot.get().refcount == 0 {
                let removed = slot.remove();
                removed.scan.dispose();
                debug!(
                    "disposed class-graph scan ({} entries)",
                    removed.scan.classpath().len()
                );
            }
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanHandle")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl ScanCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScanCacheInner {
                slots: DashMap::new(),
            }),
        }
    }

    fn key_of(classpath: &[PathBuf]) -> u64 {
        let mut hasher = FxHasher::default();
        classpath.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns a handle to the scan for `classpath`, creating it on first
    /// acquisition. Scans are populated lazily by the caller; the cache only
    /// guarantees one live scan per distinct classpath.
    pub fn acquire(&self, classpath: &[PathBuf]) -> ScanHandle {
        let key = Self::key_of(classpath);
        let mut entry = self
            .inner
            .slots
            .entry(key)
            .or_insert_with(|| ScanSlot {
                scan: Arc::new(ClassGraphScan::new(classpath.to_vec())),
                refcount: 0,
            });
        entry.refcount += 1;
        let scan = Arc::clone(&entry.scan);
        drop(entry);

        ScanHandle {
            key,
            scan,
            cache: Arc::clone(&self.inner),
            released: false,
        }
    }

    /// Evicts and disposes every scan whose classpath references outputs
    /// under `project_root`. Live handles keep their `Arc` but observe the
    /// scan as disposed and must re-acquire.
    pub fn invalidate_entries_under_project(&self, project_root: &Path) {
        let stale: Vec<u64> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.scan.references_outputs_under(project_root))
            .map(|entry| *entry.key())
            .collect();
        for key in stale {
            if let Some((_, slot)) = self.inner.slots.remove(&key) {
                slot.scan.dispose();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }
}

impl Default for ScanCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classpath(entries: &[&str]) -> Vec<PathBuf> {
        entries.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn identical_classpaths_share_a_scan() {
        let cache = ScanCache::new();
        let cp = classpath(&["/p/build/classes", "/deps/guava.jar"]);

        let a = cache.acquire(&cp);
        let b = cache.acquire(&cp);
        assert!(Arc::ptr_eq(a.scan(), b.scan()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn last_release_disposes() {
        let cache = ScanCache::new();
        let cp = classpath(&["/deps/guava.jar"]);

        let a = cache.acquire(&cp);
        let b = cache.acquire(&cp);
        let scan = Arc::clone(a.scan());

        a.release();
        assert!(!scan.is_disposed());
        b.release();
        assert!(scan.is_disposed());
        assert!(cache.is_empty());
    }

    #[test]
    fn drop_releases_implicitly() {
        let cache = ScanCache::new();
        let cp = classpath(&["/deps/guava.jar"]);
        let scan = {
            let handle = cache.acquire(&cp);
            Arc::clone(handle.scan())
        };
        assert!(scan.is_disposed());
    }

    #[test]
    fn invalidation_targets_project_outputs() {
        let cache = ScanCache::new();
        let own = cache.acquire(&classpath(&["/p/build/classes", "/deps/guava.jar"]));
        let other = cache.acquire(&classpath(&["/q/build/classes"]));

        cache.invalidate_entries_under_project(Path::new("/p"));

        assert!(own.scan().is_disposed());
        assert!(!other.scan().is_disposed());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reacquire_after_invalidation_builds_fresh_scan() {
        let cache = ScanCache::new();
        let cp = classpath(&["/p/build/classes"]);
        let stale = cache.acquire(&cp);
        cache.invalidate_entries_under_project(Path::new("/p"));

        let fresh = cache.acquire(&cp);
        assert!(!Arc::ptr_eq(stale.scan(), fresh.scan()));
        assert!(!fresh.scan().is_disposed());
    }
}
