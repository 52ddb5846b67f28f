//! On-disk classpath cache.
//!
//! Resolving a classpath costs a build-tool invocation, so resolved
//! classpaths are persisted per workspace and replayed on the next start
//! before any importer runs. The cache is advisory: a stale entry is simply
//! overridden by the next real resolution.
//!
//! One bincode file per workspace, keyed by the blake3 fingerprint of the
//! workspace root path; the file maps project roots to their classpath,
//! detected language version, and the set of roots discovered alongside
//! them. Writes are merge-updates (last write wins per project root) under a
//! per-process lock, using a temp-file-and-rename so a crash never leaves a
//! torn cache.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedClasspath {
    pub classpath: Vec<PathBuf>,
    pub language_version: Option<String>,
    /// Every project root discovered in the workspace at the time of the
    /// write; a warm start registers these before the first importer call.
    pub discovered_roots: Vec<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: HashMap<PathBuf, CachedClasspath>,
}

pub struct ClasspathCache {
    directory: PathBuf,
    enabled: bool,
    write_lock: Mutex<()>,
}

impl ClasspathCache {
    /// Cache under the platform cache directory
    /// (`~/.cache/groovy-language-server/classpaths` on Linux).
    pub fn new(enabled: bool) -> Self {
        let directory = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("groovy-language-server")
            .join("classpaths");
        Self::with_directory(directory, enabled)
    }

    pub fn with_directory(directory: PathBuf, enabled: bool) -> Self {
        Self {
            directory,
            enabled,
            write_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn file_for(&self, workspace_root: &Path) -> PathBuf {
        let fingerprint = blake3::hash(workspace_root.as_os_str().as_encoded_bytes());
        self.directory.join(format!("{}.bin", fingerprint.to_hex()))
    }

    /// All cached entries for a workspace, or `None` when disabled, absent,
    /// or unreadable (a corrupt cache is discarded, not an error).
    pub fn load(&self, workspace_root: &Path) -> Option<HashMap<PathBuf, CachedClasspath>> {
        if !self.enabled {
            return None;
        }
        let path = self.file_for(workspace_root);
        let data = std::fs::read(&path).ok()?;
        match bincode::deserialize::<CacheFile>(&data) {
            Ok(cache) => {
                debug!(
                    "loaded {} cached classpath(s) from {}",
                    cache.entries.len(),
                    path.display()
                );
                Some(cache.entries)
            }
            Err(e) => {
                warn!("discarding unreadable classpath cache {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn get(&self, workspace_root: &Path, project_root: &Path) -> Option<CachedClasspath> {
        self.load(workspace_root)?.remove(project_root)
    }

    /// Merges one project's entry into the workspace cache file.
    pub fn store(
        &self,
        workspace_root: &Path,
        project_root: &Path,
        entry: CachedClasspath,
    ) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let _guard = self.write_lock.lock();

        let path = self.file_for(workspace_root);
        let mut cache = std::fs::read(&path)
            .ok()
            .and_then(|data| bincode::deserialize::<CacheFile>(&data).ok())
            .unwrap_or_default();
        cache.entries.insert(project_root.to_path_buf(), entry);

        std::fs::create_dir_all(&self.directory)?;
        let data = bincode::serialize(&cache).map_err(io::Error::other)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &data)?;
        std::fs::rename(&temp_path, &path)?;
        debug!(
            "persisted classpath for {} ({} entries total)",
            project_root.display(),
            cache.entries.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(jars: &[&str]) -> CachedClasspath {
        CachedClasspath {
            classpath: jars.iter().map(PathBuf::from).collect(),
            language_version: Some("4.0".to_string()),
            discovered_roots: vec![PathBuf::from("/ws/a"), PathBuf::from("/ws/b")],
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ClasspathCache::with_directory(dir.path().to_path_buf(), true);
        let ws = Path::new("/ws");

        cache.store(ws, Path::new("/ws/a"), entry(&["/deps/x.jar"])).unwrap();

        let loaded = cache.get(ws, Path::new("/ws/a")).unwrap();
        assert_eq!(loaded.classpath, vec![PathBuf::from("/deps/x.jar")]);
        assert_eq!(loaded.language_version.as_deref(), Some("4.0"));
        assert_eq!(loaded.discovered_roots.len(), 2);
    }

    #[test]
    fn merge_keeps_other_projects() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ClasspathCache::with_directory(dir.path().to_path_buf(), true);
        let ws = Path::new("/ws");

        cache.store(ws, Path::new("/ws/a"), entry(&["/deps/a.jar"])).unwrap();
        cache.store(ws, Path::new("/ws/b"), entry(&["/deps/b.jar"])).unwrap();
        // Last write wins per project root.
        cache.store(ws, Path::new("/ws/a"), entry(&["/deps/a2.jar"])).unwrap();

        let entries = cache.load(ws).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[Path::new("/ws/a")].classpath,
            vec![PathBuf::from("/deps/a2.jar")]
        );
        assert_eq!(
            entries[Path::new("/ws/b")].classpath,
            vec![PathBuf::from("/deps/b.jar")]
        );
    }

    #[test]
    fn workspaces_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ClasspathCache::with_directory(dir.path().to_path_buf(), true);

        cache
            .store(Path::new("/ws1"), Path::new("/ws1/a"), entry(&["/deps/1.jar"]))
            .unwrap();
        cache
            .store(Path::new("/ws2"), Path::new("/ws2/a"), entry(&["/deps/2.jar"]))
            .unwrap();

        assert_eq!(cache.load(Path::new("/ws1")).unwrap().len(), 1);
        assert_eq!(cache.load(Path::new("/ws2")).unwrap().len(), 1);
        // A moved workspace misses; no silent migration.
        assert!(cache.load(Path::new("/ws3")).is_none());
    }

    #[test]
    fn disabled_cache_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ClasspathCache::with_directory(dir.path().to_path_buf(), false);
        cache
            .store(Path::new("/ws"), Path::new("/ws/a"), entry(&[]))
            .unwrap();
        assert!(cache.load(Path::new("/ws")).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn corrupt_cache_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ClasspathCache::with_directory(dir.path().to_path_buf(), true);
        let ws = Path::new("/ws");
        cache.store(ws, Path::new("/ws/a"), entry(&[])).unwrap();

        let file = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(&file, b"garbage").unwrap();
        assert!(cache.load(ws).is_none());
    }
}
