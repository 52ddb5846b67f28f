//! Lazy per-project classpath resolution with sibling backfill coalescing.
//!
//! A scope's classpath is resolved the first time something needs it: the
//! coordinator claims the scope (an atomic test-and-set, so concurrent
//! triggers collapse into one importer call), runs the importer on the
//! import pool, applies the result, persists it, and compiles the scope if
//! the user has files open in it.
//!
//! When the importer supports batching, each resolution also schedules a
//! **sibling backfill**: a debounced task that resolves every still-
//! unresolved sibling under the same build-tool root in a single importer
//! invocation. Rapid tab-opens across subprojects therefore cost one build
//! -tool call, not one per project. Backfill scheduling is last-writer-wins:
//! a new resolution cancels the pending backfill and schedules a fresh one
//! that subsumes its work set.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::compile::CompilationService;
use crate::exec::TaskPools;
use crate::lsp::protocol::{ClientSink, StatusState};
use crate::memory::MemoryGauge;
use crate::resolve::classpath_cache::{CachedClasspath, ClasspathCache};
use crate::resolve::importer::{Importer, ImporterRegistry};
use crate::workspace::scope::{ProjectScope, ResolutionState};
use crate::workspace::{FileContentsTracker, ScopeManager};
use tower_lsp::lsp_types::Url;

/// Debounce window coalescing sibling resolutions into one batched call.
pub const BACKFILL_DELAY: Duration = Duration::from_millis(2000);

pub struct ResolutionCoordinator {
    importers: Arc<ImporterRegistry>,
    scopes: Arc<ScopeManager>,
    compile: Arc<CompilationService>,
    contents: Arc<FileContentsTracker>,
    pools: Arc<TaskPools>,
    cache: Arc<ClasspathCache>,
    sink: Arc<dyn ClientSink>,
    gauge: Arc<dyn MemoryGauge>,
    backfill_enabled: bool,
    backfill_delay: Duration,
}

impl ResolutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        importers: Arc<ImporterRegistry>,
        scopes: Arc<ScopeManager>,
        compile: Arc<CompilationService>,
        contents: Arc<FileContentsTracker>,
        pools: Arc<TaskPools>,
        cache: Arc<ClasspathCache>,
        sink: Arc<dyn ClientSink>,
        gauge: Arc<dyn MemoryGauge>,
        backfill_enabled: bool,
    ) -> Self {
        Self {
            importers,
            scopes,
            compile,
            contents,
            pools,
            cache,
            sink,
            gauge,
            backfill_enabled,
            backfill_delay: BACKFILL_DELAY,
        }
    }

    /// Shortens the backfill debounce; test hook.
    pub fn set_backfill_delay(&mut self, delay: Duration) {
        self.backfill_delay = delay;
    }

    /// Requests resolution for a scope. No-op when the scope is already
    /// resolved or another resolution is in flight for the same root.
    ///
    /// With sibling batching enabled, a request for a project whose
    /// build-tool root already has resolution activity does not invoke the
    /// importer individually: it reschedules the coalesced backfill, which
    /// will pick this scope up together with every other unresolved sibling.
    pub fn request_resolution(self: &Arc<Self>, scope: Arc<ProjectScope>, trigger: Option<Url>) {
        if scope.is_classpath_resolved() {
            return;
        }

        if self.backfill_enabled
            && let Some(importer) = self.importers.importer_for(scope.project_root())
            && importer.supports_sibling_batching()
        {
            let build_tool_root = importer.get_build_tool_root(scope.project_root());
            let sibling_active = self.scopes.all_scopes().iter().any(|sibling| {
                sibling.project_root() != scope.project_root()
                    && sibling.project_root().starts_with(&build_tool_root)
                    && matches!(
                        sibling.resolution_state(),
                        ResolutionState::Resolving | ResolutionState::Resolved
                    )
            });
            if sibling_active {
                if scope.resolution_state() == ResolutionState::None {
                    scope.set_resolution_state(ResolutionState::Requested);
                }
                debug!(
                    "deferring {} to sibling backfill under {}",
                    scope.project_root().display(),
                    build_tool_root.display()
                );
                self.schedule_backfill(build_tool_root, importer);
                return;
            }
        }

        if !scope.mark_resolution_started() {
            debug!(
                "resolution already in flight for {}",
                scope.project_root().display()
            );
            return;
        }

        let Some(importer) = self.importers.importer_for(scope.project_root()) else {
            warn!(
                "no importer handles {}, marking resolution failed",
                scope.project_root().display()
            );
            scope.set_resolution_state(ResolutionState::Failed);
            return;
        };

        let coordinator = Arc::clone(self);
        let root = scope.project_root().to_path_buf();
        self.pools.import.spawn(&root, async move {
            coordinator.resolve_one(scope, importer, trigger).await;
            Ok(())
        });
    }

    async fn resolve_one(
        self: &Arc<Self>,
        scope: Arc<ProjectScope>,
        importer: Arc<dyn Importer>,
        trigger: Option<Url>,
    ) {
        let root = scope.project_root().to_path_buf();
        self.sink.status_update(
            StatusState::Importing,
            format!("Importing {} with {}", root.display(), importer.name()),
        );
        let started = Instant::now();

        let blocking_importer = Arc::clone(&importer);
        let blocking_root = root.clone();
        let resolved = spawn_blocking(move || {
            let classpath = blocking_importer.resolve_classpath(&blocking_root)?;
            let mark =
                blocking_importer.should_mark_classpath_resolved(&blocking_root, &classpath);
            let version = blocking_importer
                .detect_project_language_version(&blocking_root, &classpath);
            anyhow::Ok((classpath, mark, version))
        })
        .await;

        let (classpath, mark_resolved, language_version) = match resolved {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("classpath resolution failed for {}: {:#}", root.display(), e);
                scope.set_resolution_state(ResolutionState::Failed);
                self.sink
                    .status_update(StatusState::Ready, String::new());
                return;
            }
            Err(e) => {
                warn!("importer task panicked for {}: {}", root.display(), e);
                scope.set_resolution_state(ResolutionState::Failed);
                self.sink
                    .status_update(StatusState::Ready, String::new());
                return;
            }
        };
        info!(
            "resolved classpath for {} ({} entries) in {:?}",
            root.display(),
            classpath.len(),
            started.elapsed()
        );

        self.scopes
            .update_project_classpath(&root, classpath.clone(), language_version.clone(), mark_resolved)
            .await;

        // Pre-dependency sources (generated code, annotation processors) are
        // the importer's domain.
        let recompile_importer = Arc::clone(&importer);
        let recompile_root = root.clone();
        if let Ok(Err(e)) =
            spawn_blocking(move || recompile_importer.recompile(&recompile_root)).await
        {
            warn!("importer recompile failed for {}: {:#}", root.display(), e);
        }

        if mark_resolved {
            self.persist(&root, classpath, language_version);
        }

        if self.contents.has_open_under(&root) {
            let mut state = scope.state().write().await;
            self.compile
                .ensure_scope_compiled(&scope, &mut state, trigger.as_ref(), false)
                .await;
        }

        self.sink.status_update(StatusState::Ready, String::new());

        if self.backfill_enabled && importer.supports_sibling_batching() {
            self.schedule_backfill(importer.get_build_tool_root(&root), Arc::clone(&importer));
        }

        importer.download_source_jars_async(&root);
    }

    fn persist(&self, project_root: &Path, classpath: Vec<PathBuf>, version: Option<String>) {
        if !self.cache.is_enabled() {
            return;
        }
        let Some(workspace_root) = self.scopes.workspace_root() else {
            return;
        };
        let discovered_roots = self
            .scopes
            .all_scopes()
            .iter()
            .map(|scope| scope.project_root().to_path_buf())
            .collect();
        let entry = CachedClasspath {
            classpath,
            language_version: version,
            discovered_roots,
        };
        if let Err(e) = self.cache.store(&workspace_root, project_root, entry) {
            warn!("failed to persist classpath cache: {}", e);
        }
    }

    /// Schedules (or reschedules) the coalesced sibling resolution for one
    /// build-tool root.
    pub fn schedule_backfill(self: &Arc<Self>, build_tool_root: PathBuf, importer: Arc<dyn Importer>) {
        let coordinator = Arc::clone(self);
        let key = format!("backfill:{}", build_tool_root.display());
        self.pools
            .scheduler
            .debounce(key, self.backfill_delay, async move {
                coordinator.run_backfill(build_tool_root, importer).await;
                Ok(())
            });
    }

    async fn run_backfill(self: &Arc<Self>, build_tool_root: PathBuf, importer: Arc<dyn Importer>) {
        // Claim every still-unresolved sibling; anything already in flight
        // stays with its owner.
        let claimed: Vec<Arc<ProjectScope>> = self
            .scopes
            .all_scopes()
            .iter()
            .filter(|scope| scope.project_root().starts_with(&build_tool_root))
            .filter(|scope| !scope.is_classpath_resolved())
            .filter(|scope| scope.mark_resolution_started())
            .cloned()
            .collect();
        if claimed.is_empty() {
            debug!(
                "backfill for {} found no unresolved siblings",
                build_tool_root.display()
            );
            return;
        }
        info!(
            "backfilling {} sibling project(s) under {}",
            claimed.len(),
            build_tool_root.display()
        );

        let roots: Vec<PathBuf> = claimed
            .iter()
            .map(|scope| scope.project_root().to_path_buf())
            .collect();
        let blocking_importer = Arc::clone(&importer);
        let blocking_root = build_tool_root.clone();
        let blocking_roots = roots.clone();
        let resolved = spawn_blocking(move || {
            blocking_importer.resolve_classpaths_for_root(&blocking_root, &blocking_roots)
        })
        .await;

        let mut classpaths = match resolved {
            Ok(Ok(classpaths)) => classpaths,
            Ok(Err(e)) => {
                warn!(
                    "backfill resolution failed for {}: {:#}",
                    build_tool_root.display(),
                    e
                );
                for scope in &claimed {
                    scope.set_resolution_state(ResolutionState::Failed);
                }
                return;
            }
            Err(e) => {
                warn!("backfill task panicked: {}", e);
                for scope in &claimed {
                    scope.set_resolution_state(ResolutionState::Failed);
                }
                return;
            }
        };

        for scope in &claimed {
            let root = scope.project_root().to_path_buf();
            match classpaths.remove(&root) {
                Some(classpath) => {
                    let mark = importer.should_mark_classpath_resolved(&root, &classpath);
                    let version =
                        importer.detect_project_language_version(&root, &classpath);
                    self.scopes
                        .update_project_classpath(&root, classpath.clone(), version.clone(), mark)
                        .await;
                    if mark {
                        self.persist(&root, classpath, version);
                    }
                    if self.contents.has_open_under(&root) {
                        let mut state = scope.state().write().await;
                        self.compile
                            .ensure_scope_compiled(scope, &mut state, None, false)
                            .await;
                    }
                }
                None => {
                    warn!("backfill returned no classpath for {}", root.display());
                    scope.set_resolution_state(ResolutionState::Failed);
                }
            }
        }

        info!(
            "backfill done; heap {} MB used of {} MB",
            self.gauge.used_mb(),
            self.gauge.max_mb()
        );
    }

    /// Replays the on-disk cache before any importer runs: registers every
    /// previously discovered root and installs cached classpaths.
    pub async fn warm_start(&self) {
        let Some(workspace_root) = self.scopes.workspace_root() else {
            return;
        };
        let Some(entries) = self.cache.load(&workspace_root) else {
            return;
        };

        let mut discovered: Vec<PathBuf> = Vec::new();
        for entry in entries.values() {
            for root in &entry.discovered_roots {
                if !discovered.contains(root) {
                    discovered.push(root.clone());
                }
            }
        }
        self.scopes.register_discovered(discovered);

        for (root, entry) in entries {
            self.scopes
                .update_project_classpath(
                    &root,
                    entry.classpath,
                    entry.language_version,
                    true,
                )
                .await;
        }
        info!("warm start from classpath cache complete");
    }
}
