//! Scope registry: URI routing, project registration, classpath application,
//! and idle-scope eviction.
//!
//! The scope list is published atomically (replaced, never mutated) and kept
//! sorted by descending root path length, so the first prefix match during
//! routing is the longest one. Cross-scope mutation is serialized by a short
//! mutation lock; lookups never take it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::compiler::ScanCache;
use crate::exec::TaskPools;
use crate::lsp::protocol::{ClientSink, MemoryUsageParams};
use crate::memory::MemoryGauge;
use crate::workspace::scope::{ProjectScope, ResolutionState};
use crate::workspace::FileContentsTracker;
use tower_lsp::lsp_types::Url;

/// Source roots consulted when deciding whether a compiled `.class` file
/// still has a live source, and when mapping a source path to its class name.
pub(crate) const SOURCE_ROOTS: &[&str] = &[
    "src/main/groovy",
    "src/main/java",
    "src/test/groovy",
    "src/test/java",
    "src",
    "",
];

pub struct ScopeManager {
    scopes: ArcSwap<Vec<Arc<ProjectScope>>>,
    default_scope: ArcSwapOption<ProjectScope>,
    workspace_root: ArcSwapOption<PathBuf>,
    route_cache: DashMap<Url, Arc<ProjectScope>>,
    mutation: Mutex<()>,
    scans: Arc<ScanCache>,
    sink: Arc<dyn ClientSink>,
}

impl ScopeManager {
    pub fn new(scans: Arc<ScanCache>, sink: Arc<dyn ClientSink>) -> Self {
        Self {
            scopes: ArcSwap::from_pointee(Vec::new()),
            default_scope: ArcSwapOption::empty(),
            workspace_root: ArcSwapOption::empty(),
            route_cache: DashMap::new(),
            mutation: Mutex::new(()),
            scans,
            sink,
        }
    }

    /// Installs the workspace root and its default scope. Called once at
    /// initialize.
    pub fn set_workspace_root(&self, root: PathBuf) {
        self.default_scope
            .store(Some(Arc::new(ProjectScope::new_default(root.clone()))));
        self.workspace_root.store(Some(Arc::new(root)));
    }

    pub fn workspace_root(&self) -> Option<Arc<PathBuf>> {
        self.workspace_root.load_full()
    }

    pub fn default_scope(&self) -> Option<Arc<ProjectScope>> {
        self.default_scope.load_full()
    }

    pub fn all_scopes(&self) -> Arc<Vec<Arc<ProjectScope>>> {
        self.scopes.load_full()
    }

    pub fn scope_by_root(&self, root: &Path) -> Option<Arc<ProjectScope>> {
        self.scopes
            .load()
            .iter()
            .find(|scope| scope.project_root() == root)
            .cloned()
            .or_else(|| {
                self.default_scope()
                    .filter(|scope| scope.project_root() == root)
            })
    }

    /// Routes a URI to its owning scope.
    ///
    /// File URIs select the scope whose root is the longest prefix of the
    /// path; when no project is registered at all, the default scope owns
    /// everything. Jar URIs match the scope whose classpath contains the
    /// referenced archive, most recently accessed first.
    pub async fn find_scope(&self, uri: &Url) -> Option<Arc<ProjectScope>> {
        if let Some(cached) = self.route_cache.get(uri) {
            cached.touch();
            return Some(Arc::clone(&cached));
        }

        let scope = match uri.scheme() {
            "file" => self.find_file_scope(uri),
            "jar" | "zipfile" => self.find_jar_scope(uri).await,
            _ => None,
        }?;

        scope.touch();
        if uri.scheme() == "file" {
            self.route_cache.insert(uri.clone(), Arc::clone(&scope));
        }
        Some(scope)
    }

    fn find_file_scope(&self, uri: &Url) -> Option<Arc<ProjectScope>> {
        let path = uri.to_file_path().ok()?;
        let scopes = self.scopes.load();
        if scopes.is_empty() {
            return self.default_scope();
        }
        scopes
            .iter()
            .find(|scope| path.starts_with(scope.project_root()))
            .cloned()
    }

    async fn find_jar_scope(&self, uri: &Url) -> Option<Arc<ProjectScope>> {
        let jar = jar_path_of(uri)?;
        let mut owner: Option<Arc<ProjectScope>> = None;
        let scopes = self.scopes.load_full();
        for scope in scopes.iter().chain(self.default_scope().iter()) {
            let contains = {
                let state = scope.state().read().await;
                state.classpath.iter().any(|entry| entry == &jar)
            };
            if contains {
                let newer = owner
                    .as_ref()
                    .is_none_or(|best| scope.last_accessed_millis() > best.last_accessed_millis());
                if newer {
                    owner = Some(Arc::clone(scope));
                }
            }
        }
        owner
    }

    /// Registers project roots discovered in the workspace with unresolved
    /// classpaths. Existing scopes for the same roots are kept.
    pub fn register_discovered(&self, roots: Vec<PathBuf>) {
        let _guard = self.mutation.lock();
        let current = self.scopes.load_full();
        let mut scopes: Vec<Arc<ProjectScope>> = current.as_ref().clone();

        for root in roots {
            if !scopes.iter().any(|scope| scope.project_root() == root) {
                scopes.push(Arc::new(ProjectScope::new(root)));
            }
        }

        self.publish_scope_list(scopes);
        self.clear_default_scope_diagnostics();
    }

    /// Registers projects with already-known classpaths (warm start from the
    /// on-disk cache).
    pub async fn add_projects(&self, projects: Vec<(PathBuf, Vec<PathBuf>)>) {
        let roots: Vec<PathBuf> = projects.iter().map(|(root, _)| root.clone()).collect();
        self.register_discovered(roots);
        for (root, classpath) in projects {
            self.update_project_classpath(&root, classpath, None, true)
                .await;
        }
    }

    /// Applies a newly-resolved classpath to a scope. Returns `false` when no
    /// scope owns `root`.
    ///
    /// A classpath change invalidates the compilation unit and classloader
    /// (stale outputs must not be resolvable), releases the class-graph scan,
    /// resets the compiled flags so the next access recompiles, clears a
    /// prior OOM seal, and deletes output `.class` files whose sources are
    /// gone.
    pub async fn update_project_classpath(
        &self,
        root: &Path,
        classpath: Vec<PathBuf>,
        language_version: Option<String>,
        mark_resolved: bool,
    ) -> bool {
        let Some(scope) = self.scope_by_root(root) else {
            warn!("classpath update for unknown project {}", root.display());
            return false;
        };

        {
            let mut state = scope.state().write().await;
            if state.classpath != classpath {
                state.unit = None;
                if let Some(loader) = state.class_loader.take() {
                    loader.dispose();
                }
                if let Some(scan) = state.class_graph_scan.take() {
                    scan.release();
                }
                // Shared scans indexed from this project's old outputs are
                // stale too.
                self.scans.invalidate_entries_under_project(root);
                state.classpath = classpath.clone();
            }
            state.language_version = language_version;
        }

        if scope.is_compiled() {
            scope.set_compiled(false);
        }
        scope.set_compilation_failed(false);
        scope.set_classpath_resolved(mark_resolved);
        scope.set_resolution_state(if mark_resolved {
            ResolutionState::Resolved
        } else {
            ResolutionState::None
        });

        clean_stale_class_files(root, &classpath);
        info!(
            "applied classpath ({} entries) to {}",
            classpath.len(),
            root.display()
        );
        true
    }

    fn publish_scope_list(&self, mut scopes: Vec<Arc<ProjectScope>>) {
        scopes.sort_by_key(|scope| {
            std::cmp::Reverse(scope.project_root().as_os_str().len())
        });
        for scope in &scopes {
            let excluded = scopes
                .iter()
                .filter(|other| {
                    other.project_root() != scope.project_root()
                        && other.project_root().starts_with(scope.project_root())
                })
                .map(|other| other.project_root().to_path_buf())
                .collect();
            scope.set_excluded_sub_roots(excluded);
        }
        self.scopes.store(Arc::new(scopes));
        self.route_cache.clear();
    }

    fn clear_default_scope_diagnostics(&self) {
        if let Some(default) = self.default_scope() {
            for entry in default.previous_diagnostics_by_uri.iter() {
                self.sink
                    .publish_diagnostics(entry.key().clone(), Vec::new(), None);
            }
            default.previous_diagnostics_by_uri.clear();
        }
    }

    pub fn memory_usage(&self, gauge: &dyn MemoryGauge) -> MemoryUsageParams {
        let scopes = self.scopes.load();
        let evicted = scopes.iter().filter(|scope| scope.is_evicted()).count();
        MemoryUsageParams {
            used_mb: gauge.used_mb(),
            max_mb: gauge.max_mb(),
            active_scopes: scopes.len() - evicted,
            evicted_scopes: evicted,
            total_scopes: scopes.len(),
        }
    }

    /// One sweep of the eviction policy: scopes with no open files idle past
    /// the TTL lose their heavy state; under memory pressure the
    /// least-recently-accessed non-open scope is evicted regardless of TTL.
    pub async fn sweep_once(
        &self,
        contents: &FileContentsTracker,
        gauge: &dyn MemoryGauge,
        ttl: Duration,
        pressure_threshold: f64,
    ) -> usize {
        let mut evicted = 0;
        let scopes = self.scopes.load_full();

        for scope in scopes.iter() {
            if scope.is_evicted() || !scope.is_compiled() {
                continue;
            }
            if contents.has_open_under(scope.project_root()) {
                continue;
            }
            if Duration::from_millis(scope.idle_millis()) >= ttl {
                let mut state = scope.state().write().await;
                scope.evict(&mut state);
                evicted += 1;
            }
        }

        if gauge.under_pressure(pressure_threshold) {
            let candidate = scopes
                .iter()
                .filter(|scope| {
                    !scope.is_evicted()
                        && scope.is_compiled()
                        && !contents.has_open_under(scope.project_root())
                })
                .min_by_key(|scope| scope.last_accessed_millis());
            if let Some(scope) = candidate {
                debug!(
                    "memory pressure: evicting {} ({} MB used of {} MB)",
                    scope.project_root().display(),
                    gauge.used_mb(),
                    gauge.max_mb()
                );
                let mut state = scope.state().write().await;
                scope.evict(&mut state);
                evicted += 1;
            }
        }

        evicted
    }

    /// Spawns the periodic sweeper. It also reports memory usage to the
    /// editor on every tick.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        pools: &TaskPools,
        contents: Arc<FileContentsTracker>,
        gauge: Arc<dyn MemoryGauge>,
        ttl: Duration,
        pressure_threshold: f64,
        interval: Duration,
    ) {
        let manager = Arc::clone(self);
        let mut shutdown_rx = pools.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = manager
                            .sweep_once(&contents, gauge.as_ref(), ttl, pressure_threshold)
                            .await;
                        if evicted > 0 {
                            info!("sweeper evicted {} idle scope(s)", evicted);
                        }
                        manager.sink.memory_usage(manager.memory_usage(gauge.as_ref()));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

/// Extracts the archive path from a `jar:file:///…!/…` style URI.
fn jar_path_of(uri: &Url) -> Option<PathBuf> {
    let raw = uri.as_str();
    let rest = raw
        .strip_prefix("jar:")
        .or_else(|| raw.strip_prefix("zipfile:"))?;
    let inner = rest.split('!').next()?;
    if let Some(path) = inner.strip_prefix("file://") {
        Some(PathBuf::from(path))
    } else {
        Some(PathBuf::from(inner))
    }
}

/// Deletes compiled `.class` files under the project's output directories
/// whose source no longer exists. Stale class files would otherwise be
/// resolved by the classloader in preference to source.
pub fn clean_stale_class_files(project_root: &Path, classpath: &[PathBuf]) {
    for entry in classpath {
        if !entry.starts_with(project_root) || !entry.is_dir() {
            continue;
        }
        for class_file in WalkDir::new(entry)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "class"))
        {
            let Ok(relative) = class_file.path().strip_prefix(entry) else {
                continue;
            };
            if !has_live_source(project_root, relative) {
                debug!("removing stale class file {}", class_file.path().display());
                if let Err(e) = std::fs::remove_file(class_file.path()) {
                    debug!(
                        "failed to remove {}: {}",
                        class_file.path().display(),
                        e
                    );
                }
            }
        }
    }
}

fn has_live_source(project_root: &Path, relative_class: &Path) -> bool {
    let Some(stem) = relative_class.file_stem().and_then(|s| s.to_str()) else {
        return true;
    };
    // Inner classes (Foo$Bar.class) share their outer class's source file.
    let outer = stem.split('$').next().unwrap_or(stem);
    let parent = relative_class.parent().unwrap_or(Path::new(""));

    for source_root in SOURCE_ROOTS {
        for extension in ["groovy", "java"] {
            let candidate = project_root
                .join(source_root)
                .join(parent)
                .join(format!("{outer}.{extension}"));
            if candidate.exists() {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    fn manager() -> Arc<ScopeManager> {
        Arc::new(ScopeManager::new(
            Arc::new(ScanCache::new()),
            Arc::new(RecordingSink::new()),
        ))
    }

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/app"), PathBuf::from("/ws/app/core")]);

        let scope = m.find_scope(&uri("/ws/app/core/src/A.groovy")).await.unwrap();
        assert_eq!(scope.project_root(), Path::new("/ws/app/core"));

        let scope = m.find_scope(&uri("/ws/app/src/B.groovy")).await.unwrap();
        assert_eq!(scope.project_root(), Path::new("/ws/app"));
    }

    #[tokio::test]
    async fn empty_registry_routes_to_default() {
        let m = manager();
        m.set_workspace_root(PathBuf::from("/ws"));
        let scope = m.find_scope(&uri("/ws/scripts/build.groovy")).await.unwrap();
        assert!(scope.is_default());
    }

    #[tokio::test]
    async fn unmatched_uri_with_projects_routes_nowhere() {
        let m = manager();
        m.set_workspace_root(PathBuf::from("/ws"));
        m.register_discovered(vec![PathBuf::from("/ws/app")]);
        assert!(m.find_scope(&uri("/elsewhere/A.groovy")).await.is_none());
    }

    #[tokio::test]
    async fn route_cache_is_cleared_on_registration() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/app")]);

        let file = uri("/ws/app/core/src/A.groovy");
        let first = m.find_scope(&file).await.unwrap();
        assert_eq!(first.project_root(), Path::new("/ws/app"));

        // A more specific project appears; the cached route must not stick.
        m.register_discovered(vec![PathBuf::from("/ws/app/core")]);
        let second = m.find_scope(&file).await.unwrap();
        assert_eq!(second.project_root(), Path::new("/ws/app/core"));
    }

    #[tokio::test]
    async fn exclusion_lists_cover_nested_roots() {
        let m = manager();
        m.register_discovered(vec![
            PathBuf::from("/ws/app"),
            PathBuf::from("/ws/app/core"),
            PathBuf::from("/ws/app/web"),
        ]);
        let app = m.scope_by_root(Path::new("/ws/app")).unwrap();
        let excluded = app.excluded_sub_roots();
        assert_eq!(excluded.len(), 2);
        assert!(excluded.contains(&PathBuf::from("/ws/app/core")));
        assert!(excluded.contains(&PathBuf::from("/ws/app/web")));
    }

    #[tokio::test]
    async fn jar_uri_routes_by_classpath_membership() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/a"), PathBuf::from("/ws/b")]);
        m.update_project_classpath(
            Path::new("/ws/a"),
            vec![PathBuf::from("/deps/guava.jar")],
            None,
            true,
        )
        .await;
        m.update_project_classpath(
            Path::new("/ws/b"),
            vec![PathBuf::from("/deps/other.jar")],
            None,
            true,
        )
        .await;

        let jar = Url::parse("jar:file:///deps/guava.jar!/com/google/Foo.class").unwrap();
        let scope = m.find_scope(&jar).await.unwrap();
        assert_eq!(scope.project_root(), Path::new("/ws/a"));
    }

    #[tokio::test]
    async fn classpath_update_resets_lifecycle() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/app")]);
        let scope = m.scope_by_root(Path::new("/ws/app")).unwrap();
        scope.set_fully_compiled();
        scope.set_compilation_failed(true);

        assert!(
            m.update_project_classpath(
                Path::new("/ws/app"),
                vec![PathBuf::from("/deps/x.jar")],
                Some("4.0".to_string()),
                true,
            )
            .await
        );

        assert!(scope.is_classpath_resolved());
        assert!(!scope.is_compiled());
        assert!(!scope.is_fully_compiled());
        assert!(!scope.is_compilation_failed());
        assert_eq!(
            scope.state().read().await.language_version.as_deref(),
            Some("4.0")
        );
    }

    #[tokio::test]
    async fn degraded_classpath_leaves_scope_unresolved() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/app")]);
        m.update_project_classpath(
            Path::new("/ws/app"),
            vec![PathBuf::from("/ws/app/build/classes")],
            None,
            false,
        )
        .await;
        let scope = m.scope_by_root(Path::new("/ws/app")).unwrap();
        assert!(!scope.is_classpath_resolved());
    }

    #[tokio::test]
    async fn ttl_eviction_skips_open_scopes() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/a"), PathBuf::from("/ws/b")]);
        let a = m.scope_by_root(Path::new("/ws/a")).unwrap();
        let b = m.scope_by_root(Path::new("/ws/b")).unwrap();
        a.set_fully_compiled();
        b.set_fully_compiled();

        let contents = FileContentsTracker::new();
        contents.did_open(uri("/ws/a/src/A.groovy"), String::new(), 1);

        let gauge = crate::memory::FixedMemoryGauge::new(0, 1 << 30);
        let evicted = m
            .sweep_once(&contents, &gauge, Duration::ZERO, 0.85)
            .await;

        assert_eq!(evicted, 1);
        assert!(!a.is_evicted());
        assert!(b.is_evicted());
        assert!(!b.is_compiled());
    }

    #[tokio::test]
    async fn pressure_evicts_lru_scope_before_ttl() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/a"), PathBuf::from("/ws/b")]);
        let a = m.scope_by_root(Path::new("/ws/a")).unwrap();
        let b = m.scope_by_root(Path::new("/ws/b")).unwrap();
        a.set_fully_compiled();
        b.set_fully_compiled();
        tokio::time::sleep(Duration::from_millis(5)).await;
        b.touch();

        let contents = FileContentsTracker::new();
        let gauge = crate::memory::FixedMemoryGauge::new(900, 1000);
        let evicted = m
            .sweep_once(&contents, &gauge, Duration::from_secs(3600), 0.85)
            .await;

        assert_eq!(evicted, 1);
        assert!(a.is_evicted());
        assert!(!b.is_evicted());
    }

    #[tokio::test]
    async fn memory_usage_counts_evicted_scopes() {
        let m = manager();
        m.register_discovered(vec![PathBuf::from("/ws/a"), PathBuf::from("/ws/b")]);
        let a = m.scope_by_root(Path::new("/ws/a")).unwrap();
        a.set_evicted(true);

        let gauge = crate::memory::FixedMemoryGauge::new(512 << 20, 1 << 30);
        let usage = m.memory_usage(&gauge);
        assert_eq!(usage.total_scopes, 2);
        assert_eq!(usage.evicted_scopes, 1);
        assert_eq!(usage.active_scopes, 1);
        assert_eq!(usage.used_mb, 512);
    }

    #[test]
    fn stale_class_cleanup_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let out = root.join("build/classes");
        std::fs::create_dir_all(out.join("com/example")).unwrap();
        std::fs::create_dir_all(root.join("src/main/groovy/com/example")).unwrap();

        std::fs::write(
            root.join("src/main/groovy/com/example/Kept.groovy"),
            "class Kept {}",
        )
        .unwrap();
        std::fs::write(out.join("com/example/Kept.class"), b"cafebabe").unwrap();
        std::fs::write(out.join("com/example/Kept$Closure1.class"), b"cafebabe").unwrap();
        std::fs::write(out.join("com/example/Orphan.class"), b"cafebabe").unwrap();

        clean_stale_class_files(root, &[out.clone()]);

        assert!(out.join("com/example/Kept.class").exists());
        assert!(out.join("com/example/Kept$Closure1.class").exists());
        assert!(!out.join("com/example/Orphan.class").exists());
    }

    #[test]
    fn jar_path_extraction() {
        let jar = Url::parse("jar:file:///deps/guava.jar!/com/google/Foo.class").unwrap();
        assert_eq!(jar_path_of(&jar), Some(PathBuf::from("/deps/guava.jar")));
    }
}
