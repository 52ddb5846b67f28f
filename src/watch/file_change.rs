//! Watched-file routing: classification, class-move detection, and the
//! debounced Java/build recompile.
//!
//! `didChangeWatchedFiles` events fall into three buckets per project:
//!
//! - **foreign sources** (`.java` and friends): the compiler cannot compile
//!   these, but their outputs feed the classpath, so the build tool must
//!   recompile them before the scope rebuilds;
//! - **build descriptors** (`build.gradle`, `pom.xml`, …): the classpath
//!   itself may have changed, same treatment;
//! - **target-language sources** (`.groovy`): routed straight through the
//!   standard incremental/full compile path.
//!
//! Build outputs (`build/`, `target/`, `.gradle/`, `out/`, `bin/`) are
//! ignored for trigger classification: annotation processors and code
//! generators write there during the very recompiles these events trigger,
//! and reacting to them would loop.
//!
//! Foreign and build changes schedule one debounced recompile per project
//! root (2 s, cancel-and-replace), so a branch switch touching hundreds of
//! files costs one build-tool invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::task::spawn_blocking;
use tower_lsp::lsp_types::{FileChangeType, FileEvent, Url};
use tracing::{debug, info, warn};

use crate::compile::CompilationService;
use crate::compiler::{Compiler, ScanCache};
use crate::exec::TaskPools;
use crate::resolve::ImporterRegistry;
use crate::workspace::scope::ProjectScope;
use crate::workspace::scope_manager::{SOURCE_ROOTS, clean_stale_class_files};
use crate::workspace::{FileContentsTracker, ScopeManager};

/// Debounce window for build-tool recompiles triggered by foreign-source or
/// build-descriptor changes.
pub const JAVA_RECOMPILE_DELAY: Duration = Duration::from_millis(2000);

const BUILD_DESCRIPTORS: &[&str] = &[
    "build.gradle",
    "build.gradle.kts",
    "pom.xml",
    "settings.gradle",
    "settings.gradle.kts",
];
const FOREIGN_SOURCE_EXTENSIONS: &[&str] = &["java", "kt", "scala"];
const OUTPUT_DIRS: &[&str] = &["build", "target", ".gradle", "out", "bin"];

/// Observer of class moves (a delete/create pair for the same file name
/// within one project). Drives import rewrites on the editor side.
pub trait ClassMoveListener: Send + Sync {
    fn class_moved(&self, old_fqcn: &str, new_fqcn: &str);
}

#[derive(Default)]
struct ScopeChanges {
    foreign: Vec<Url>,
    build: Vec<Url>,
    created: Vec<Url>,
    changed: Vec<Url>,
    deleted: Vec<Url>,
}

impl ScopeChanges {
    fn needs_build_recompile(&self) -> bool {
        !self.foreign.is_empty() || !self.build.is_empty()
    }

    fn has_source_changes(&self) -> bool {
        !self.created.is_empty() || !self.changed.is_empty() || !self.deleted.is_empty()
    }
}

pub struct FileChangeHandler {
    contents: Arc<FileContentsTracker>,
    scopes: Arc<ScopeManager>,
    compile: Arc<CompilationService>,
    pools: Arc<TaskPools>,
    importers: Arc<ImporterRegistry>,
    scans: Arc<ScanCache>,
    compiler: Arc<dyn Compiler>,
    move_listeners: RwLock<Vec<Arc<dyn ClassMoveListener>>>,
    recompile_delay: Duration,
}

impl FileChangeHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contents: Arc<FileContentsTracker>,
        scopes: Arc<ScopeManager>,
        compile: Arc<CompilationService>,
        pools: Arc<TaskPools>,
        importers: Arc<ImporterRegistry>,
        scans: Arc<ScanCache>,
        compiler: Arc<dyn Compiler>,
    ) -> Self {
        Self {
            contents,
            scopes,
            compile,
            pools,
            importers,
            scans,
            compiler,
            move_listeners: RwLock::new(Vec::new()),
            recompile_delay: JAVA_RECOMPILE_DELAY,
        }
    }

    /// Shortens the recompile debounce; test hook.
    pub fn set_recompile_delay(&mut self, delay: Duration) {
        self.recompile_delay = delay;
    }

    pub fn add_move_listener(&self, listener: Arc<dyn ClassMoveListener>) {
        self.move_listeners.write().push(listener);
    }

    pub async fn handle_watched_files(self: &Arc<Self>, events: Vec<FileEvent>) {
        let uris: Vec<&Url> = events.iter().map(|event| &event.uri).collect();
        self.contents.invalidate_closed_cache(uris);

        let mut by_scope: FxHashMap<PathBuf, (Arc<ProjectScope>, ScopeChanges)> =
            FxHashMap::default();
        for event in events {
            let Some(scope) = self.scopes.find_scope(&event.uri).await else {
                continue;
            };
            let Ok(path) = event.uri.to_file_path() else {
                continue;
            };
            if is_build_output(scope.project_root(), &path) {
                continue;
            }

            let changes = &mut by_scope
                .entry(scope.project_root().to_path_buf())
                .or_insert_with(|| (scope, ScopeChanges::default()))
                .1;

            if is_build_descriptor(&path) {
                changes.build.push(event.uri);
            } else if is_foreign_source(&path) {
                changes.foreign.push(event.uri);
            } else if is_target_source(&path) {
                match event.typ {
                    FileChangeType::CREATED => changes.created.push(event.uri),
                    FileChangeType::DELETED => changes.deleted.push(event.uri),
                    _ => changes.changed.push(event.uri),
                }
            }
        }

        for (_, (scope, changes)) in &by_scope {
            self.detect_class_moves(scope, changes);
        }

        for (root, (scope, changes)) in by_scope {
            if changes.needs_build_recompile() {
                self.invalidate_for_build_change(&scope).await;
                self.schedule_build_recompile(Arc::clone(&scope));
                info!(
                    "scheduled build recompile of {} ({} foreign, {} build file(s))",
                    root.display(),
                    changes.foreign.len(),
                    changes.build.len()
                );
            }
            if changes.has_source_changes() {
                self.apply_source_changes(&scope, &changes).await;
            }
        }
    }

    /// Pairs deletes with creates sharing a file name within the project and
    /// reports the class move to listeners.
    fn detect_class_moves(&self, scope: &Arc<ProjectScope>, changes: &ScopeChanges) {
        if changes.deleted.is_empty() || changes.created.is_empty() {
            return;
        }
        let listeners = self.move_listeners.read();
        for deleted in &changes.deleted {
            let Some(deleted_name) = file_name_of(deleted) else {
                continue;
            };
            let paired = changes
                .created
                .iter()
                .find(|created| file_name_of(created).as_deref() == Some(deleted_name.as_str()));
            if let Some(created) = paired {
                let (Some(old_fqcn), Some(new_fqcn)) = (
                    fqcn_of(scope.project_root(), deleted),
                    fqcn_of(scope.project_root(), created),
                ) else {
                    continue;
                };
                if old_fqcn != new_fqcn {
                    info!("class move detected: {} -> {}", old_fqcn, new_fqcn);
                    for listener in listeners.iter() {
                        listener.class_moved(&old_fqcn, &new_fqcn);
                    }
                }
            }
        }
    }

    /// A foreign-source or build change invalidates everything derived from
    /// the project's outputs: the shared classpath indexes, the scope's
    /// scan, and the compilation unit (the classloader must go, or deleted
    /// outputs would still resolve).
    async fn invalidate_for_build_change(&self, scope: &Arc<ProjectScope>) {
        self.scans
            .invalidate_entries_under_project(scope.project_root());
        let mut state = scope.state().write().await;
        if let Some(scan) = state.class_graph_scan.take() {
            scan.release();
        }
        state.unit = None;
        if let Some(loader) = state.class_loader.take() {
            loader.dispose();
        }
    }

    /// One debounced recompile per project root: build-tool recompile, stale
    /// output cleanup, then a full scope rebuild.
    fn schedule_build_recompile(self: &Arc<Self>, scope: Arc<ProjectScope>) {
        let handler = Arc::clone(self);
        let root = scope.project_root().to_path_buf();
        let key = format!("java-recompile:{}", root.display());
        self.pools
            .scheduler
            .debounce(key, self.recompile_delay, async move {
                if let Some(importer) = handler.importers.importer_for(&root) {
                    let blocking_root = root.clone();
                    if let Ok(Err(e)) =
                        spawn_blocking(move || importer.recompile(&blocking_root)).await
                    {
                        warn!("build-tool recompile failed for {}: {:#}", root.display(), e);
                    }
                }

                let classpath = scope.state().read().await.classpath.clone();
                clean_stale_class_files(&root, &classpath);

                let mut state = scope.state().write().await;
                scope.set_compiled(false);
                handler.compile.compile_fully(&scope, &mut state).await;
                Ok(())
            });
    }

    /// Routes target-language source changes through the standard compile
    /// path. Scopes without a resolved classpath are skipped; resolution,
    /// not compilation, is their next step.
    async fn apply_source_changes(&self, scope: &Arc<ProjectScope>, changes: &ScopeChanges) {
        if !scope.is_classpath_resolved() {
            debug!(
                "skipping source changes in {}: classpath not resolved",
                scope.project_root().display()
            );
            return;
        }

        let mut state = scope.state().write().await;
        self.compiler.invalidate_file_cache(scope.project_root());

        for deleted in &changes.deleted {
            state.dependency_graph.remove(deleted);
            if scope.previous_diagnostics_by_uri.remove(deleted).is_some() {
                // The file is gone; its diagnostics must not linger.
                self.compile.clear_diagnostics(deleted);
            }
        }

        self.contents.force_changed(
            changes
                .created
                .iter()
                .chain(changes.changed.iter())
                .cloned(),
        );

        if scope.is_compiled() {
            self.compile
                .update_and_recompile(scope, &mut state, None)
                .await;
        } else {
            self.compile
                .ensure_scope_compiled(scope, &mut state, None, false)
                .await;
        }
    }
}

fn is_build_output(project_root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(project_root) else {
        return false;
    };
    relative
        .components()
        .next()
        .and_then(|component| component.as_os_str().to_str())
        .is_some_and(|first| OUTPUT_DIRS.contains(&first))
}

fn is_build_descriptor(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| BUILD_DESCRIPTORS.contains(&name))
}

fn is_foreign_source(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| FOREIGN_SOURCE_EXTENSIONS.contains(&ext))
}

fn is_target_source(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "groovy")
}

fn file_name_of(uri: &Url) -> Option<String> {
    uri.to_file_path()
        .ok()?
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
}

/// Fully qualified class name implied by a source path: the path relative to
/// the project's source root with separators turned into dots.
fn fqcn_of(project_root: &Path, uri: &Url) -> Option<String> {
    let path = uri.to_file_path().ok()?;
    let relative = path.strip_prefix(project_root).ok()?;
    let without_extension = relative.with_extension("");

    let trimmed = SOURCE_ROOTS
        .iter()
        .filter(|source_root| !source_root.is_empty())
        .find_map(|source_root| {
            without_extension
                .strip_prefix(source_root)
                .ok()
                .map(Path::to_path_buf)
        })
        .unwrap_or(without_extension);

    let mut fqcn = String::new();
    for component in trimmed.components() {
        if !fqcn.is_empty() {
            fqcn.push('.');
        }
        fqcn.push_str(component.as_os_str().to_str()?);
    }
    Some(fqcn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_paths_are_ignored() {
        let root = Path::new("/ws/app");
        assert!(is_build_output(root, Path::new("/ws/app/build/classes/A.class")));
        assert!(is_build_output(root, Path::new("/ws/app/target/A.class")));
        assert!(is_build_output(root, Path::new("/ws/app/.gradle/cache.bin")));
        assert!(!is_build_output(root, Path::new("/ws/app/src/main/groovy/A.groovy")));
        // "buildSrc" is not "build".
        assert!(!is_build_output(root, Path::new("/ws/app/buildSrc/A.groovy")));
    }

    #[test]
    fn classification_by_name_and_extension() {
        assert!(is_build_descriptor(Path::new("/p/build.gradle")));
        assert!(is_build_descriptor(Path::new("/p/build.gradle.kts")));
        assert!(is_build_descriptor(Path::new("/p/pom.xml")));
        assert!(!is_build_descriptor(Path::new("/p/README.md")));

        assert!(is_foreign_source(Path::new("/p/src/main/java/A.java")));
        assert!(!is_foreign_source(Path::new("/p/src/main/groovy/A.groovy")));

        assert!(is_target_source(Path::new("/p/src/main/groovy/A.groovy")));
        assert!(!is_target_source(Path::new("/p/src/main/java/A.java")));
    }

    #[test]
    fn fqcn_from_conventional_layout() {
        let uri =
            Url::parse("file:///ws/app/src/main/groovy/com/example/Service.groovy").unwrap();
        assert_eq!(
            fqcn_of(Path::new("/ws/app"), &uri).as_deref(),
            Some("com.example.Service")
        );
    }

    #[test]
    fn fqcn_from_flat_layout() {
        let uri = Url::parse("file:///ws/app/scripts/Deploy.groovy").unwrap();
        assert_eq!(
            fqcn_of(Path::new("/ws/app"), &uri).as_deref(),
            Some("scripts.Deploy")
        );
    }
}
