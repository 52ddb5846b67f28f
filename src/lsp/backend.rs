//! The server core: ownership and lifecycle of every orchestrator component.
//!
//! [`ServerCore`] is the transport-free composition root: everything the
//! LSP handlers do is a method here, so integration tests drive the full
//! orchestration pipeline against a recording sink without a wire protocol.
//! [`GroovyBackend`] wraps a core with the `tower-lsp` surface; the core is
//! built during `initialize`, once the client has delivered its options and
//! workspace root.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};
use tower_lsp::{Client, ClientSocket, LspService};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::compile::CompilationService;
use crate::compiler::{Compiler, ScanCache};
use crate::config::{ServerOptions, WorkspaceConfig};
use crate::exec::TaskPools;
use crate::lsp::protocol::{ClientSink, StatusState, TowerLspSink};
use crate::lsp::providers::FeatureProviders;
use crate::memory::{MemoryGauge, ProcessMemoryGauge};
use crate::resolve::{ClasspathCache, ImporterRegistry, ResolutionCoordinator};
use crate::resolve::Importer;
use crate::watch::FileChangeHandler;
use crate::workspace::{FileContentsTracker, ProjectScope, ScopeManager};

mod handlers;

/// Debounce window between an edit and the recompile it triggers.
const DID_CHANGE_DEBOUNCE: Duration = Duration::from_millis(300);
/// Eviction sweeper tick.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Knobs for building a [`ServerCore`]. Production uses the defaults; tests
/// shorten the debounces and swap the gauge and cache directory.
#[derive(Default)]
pub struct CoreConfig {
    pub options: ServerOptions,
    pub workspace_root: Option<PathBuf>,
    pub cache_directory: Option<PathBuf>,
    pub backfill_delay: Option<Duration>,
    pub recompile_delay: Option<Duration>,
    pub gauge: Option<Arc<dyn MemoryGauge>>,
}

pub struct ServerCore {
    pub options: Arc<ServerOptions>,
    pub contents: Arc<FileContentsTracker>,
    pub scopes: Arc<ScopeManager>,
    pub compile: Arc<CompilationService>,
    pub resolution: Arc<ResolutionCoordinator>,
    pub watcher: Arc<FileChangeHandler>,
    pub pools: Arc<TaskPools>,
    pub scans: Arc<ScanCache>,
    pub gauge: Arc<dyn MemoryGauge>,
    pub sink: Arc<dyn ClientSink>,
    pub workspace_config: RwLock<WorkspaceConfig>,
}

impl ServerCore {
    pub fn build(
        compiler: Arc<dyn Compiler>,
        importers: Vec<Arc<dyn Importer>>,
        sink: Arc<dyn ClientSink>,
        config: CoreConfig,
    ) -> Arc<Self> {
        let options = Arc::new(config.options);
        let pools = Arc::new(TaskPools::new());
        let contents = Arc::new(FileContentsTracker::new());
        let scans = Arc::new(ScanCache::new());
        let scopes = Arc::new(ScopeManager::new(Arc::clone(&scans), Arc::clone(&sink)));
        if let Some(root) = config.workspace_root {
            scopes.set_workspace_root(root);
        }

        let gauge = config
            .gauge
            .unwrap_or_else(|| Arc::new(ProcessMemoryGauge::new(options.max_heap_mb)));
        let compile = Arc::new(CompilationService::new(
            Arc::clone(&compiler),
            Arc::clone(&contents),
            Arc::clone(&pools),
            Arc::clone(&sink),
            Arc::clone(&gauge),
            Arc::clone(&options),
        ));

        let registry = Arc::new(ImporterRegistry::new(
            importers,
            options.enabled_importers.as_deref(),
        ));
        let cache = Arc::new(match config.cache_directory {
            Some(directory) => ClasspathCache::with_directory(directory, options.classpath_cache),
            None => ClasspathCache::new(options.classpath_cache),
        });

        let mut resolution = ResolutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&scopes),
            Arc::clone(&compile),
            Arc::clone(&contents),
            Arc::clone(&pools),
            cache,
            Arc::clone(&sink),
            Arc::clone(&gauge),
            options.backfill_sibling_projects,
        );
        if let Some(delay) = config.backfill_delay {
            resolution.set_backfill_delay(delay);
        }
        let resolution = Arc::new(resolution);

        let mut watcher = FileChangeHandler::new(
            Arc::clone(&contents),
            Arc::clone(&scopes),
            Arc::clone(&compile),
            Arc::clone(&pools),
            Arc::clone(&registry),
            Arc::clone(&scans),
            Arc::clone(&compiler),
        );
        if let Some(delay) = config.recompile_delay {
            watcher.set_recompile_delay(delay);
        }

        Arc::new(Self {
            options,
            contents,
            scopes,
            compile,
            resolution,
            watcher: Arc::new(watcher),
            pools,
            scans,
            gauge,
            sink,
            workspace_config: RwLock::new(WorkspaceConfig::default()),
        })
    }

    /// Post-`initialized` workspace setup: replay the classpath cache, then
    /// walk the workspace for build descriptors and register what they root.
    pub async fn initialize_workspace(&self) {
        if let Some(root) = self.scopes.workspace_root() {
            self.resolution.warm_start().await;
            let roots = discover_project_roots(&root);
            if roots.is_empty() {
                debug!("no build descriptors under {}", root.display());
            } else {
                info!("registering {} discovered project root(s)", roots.len());
                self.scopes.register_discovered(roots);
            }
        }
        self.sink
            .status_update(StatusState::Ready, String::new());
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        self.scopes.spawn_sweeper(
            &self.pools,
            Arc::clone(&self.contents),
            Arc::clone(&self.gauge),
            Duration::from_secs(self.options.scope_eviction_ttl_seconds),
            self.options.memory_pressure_threshold,
            SWEEP_INTERVAL,
        );
    }

    pub async fn did_open(&self, uri: Url, text: String, version: i32) {
        self.contents.did_open(uri.clone(), text, version);
        let Some(scope) = self.scopes.find_scope(&uri).await else {
            debug!("no scope owns {}", uri);
            return;
        };

        if !scope.is_classpath_resolved() {
            // Immediate parse feedback while the importer works.
            self.compile
                .syntax_check_single_file(Arc::clone(&scope), uri.clone());
            self.resolution
                .request_resolution(Arc::clone(&scope), Some(uri));
            return;
        }

        let mut state = scope.state().write().await;
        let launched = self
            .compile
            .ensure_scope_compiled(&scope, &mut state, Some(&uri), true)
            .await;
        if !launched {
            self.compile
                .update_and_recompile(&scope, &mut state, Some(&uri))
                .await;
        }
    }

    /// Applies the edit immediately; the recompile is debounced and strictly
    /// last-writer-wins across all documents.
    pub fn did_change(
        self: &Arc<Self>,
        uri: Url,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) {
        self.contents.did_change(&uri, version, &changes);
        let core = Arc::clone(self);
        self.pools.scheduler.debounce(
            "did-change-recompile".to_string(),
            DID_CHANGE_DEBOUNCE,
            async move {
                core.recompile_after_change(uri).await;
                Ok(())
            },
        );
    }

    pub fn did_save(self: &Arc<Self>, uri: Url) {
        self.contents.force_changed([uri.clone()]);
        let core = Arc::clone(self);
        self.pools.scheduler.debounce(
            "did-change-recompile".to_string(),
            DID_CHANGE_DEBOUNCE,
            async move {
                core.recompile_after_change(uri).await;
                Ok(())
            },
        );
    }

    pub fn did_close(&self, uri: &Url) {
        self.contents.did_close(uri);
    }

    async fn recompile_after_change(&self, uri: Url) {
        let Some(scope) = self.scopes.find_scope(&uri).await else {
            return;
        };
        if !scope.is_classpath_resolved() {
            self.compile
                .syntax_check_single_file(Arc::clone(&scope), uri.clone());
            self.resolution.request_resolution(scope, Some(uri));
            return;
        }
        let mut state = scope.state().write().await;
        self.compile
            .update_and_recompile(&scope, &mut state, Some(&uri))
            .await;
    }

    pub async fn did_change_watched_files(
        &self,
        events: Vec<tower_lsp::lsp_types::FileEvent>,
    ) {
        self.watcher.handle_watched_files(events).await;
    }

    pub async fn did_change_configuration(&self, settings: Value) {
        let classpath_changed = self.workspace_config.write().apply_settings(&settings);
        if !classpath_changed {
            return;
        }
        if let Some(default) = self.scopes.default_scope() {
            let classpath: Vec<PathBuf> = self
                .workspace_config
                .read()
                .classpath
                .iter()
                .map(PathBuf::from)
                .collect();
            let root = default.project_root().to_path_buf();
            self.scopes
                .update_project_classpath(&root, classpath, None, true)
                .await;
        }
    }

    /// Pre-request routing: find the scope, record the request focus, and
    /// bring its AST up to date (or kick off resolution when the classpath
    /// is still pending).
    pub async fn ensure_ready(&self, uri: &Url) -> Option<Arc<ProjectScope>> {
        let scope = self.scopes.find_scope(uri).await?;
        *scope.previous_context_uri.lock() = Some(uri.clone());

        if !scope.is_classpath_resolved() {
            self.resolution
                .request_resolution(Arc::clone(&scope), Some(uri.clone()));
            return Some(scope);
        }

        // Fast path: a current scope serves readers off the published AST
        // snapshot without touching the write lock.
        if scope.is_compiled() && !self.contents.has_changed_under(scope.project_root()) {
            return Some(scope);
        }

        let mut state = scope.state().write().await;
        if !scope.is_compiled() {
            self.compile
                .ensure_scope_compiled(&scope, &mut state, Some(uri), false)
                .await;
        } else if self.contents.has_changed_under(scope.project_root()) {
            self.compile
                .update_and_recompile(&scope, &mut state, Some(uri))
                .await;
        }
        drop(state);
        Some(scope)
    }

    /// `ensure_ready` plus placeholder injection, for requests that need an
    /// AST node exactly under the cursor (completion, signature help).
    pub async fn ensure_ready_at(
        &self,
        uri: &Url,
        position: tower_lsp::lsp_types::Position,
    ) -> Option<Arc<ProjectScope>> {
        let scope = self.ensure_ready(uri).await?;
        if scope.is_classpath_resolved() && !scope.is_compilation_failed() {
            let mut state = scope.state().write().await;
            self.compile
                .ensure_ast_for_position(&scope, &mut state, uri, position)
                .await;
        }
        Some(scope)
    }

    pub fn shutdown(&self) {
        self.pools.shutdown();
    }
}

/// Directories rooting a build-tool project: anything holding a build
/// descriptor, excluding output and VCS trees.
pub fn discover_project_roots(workspace_root: &Path) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for entry in WalkDir::new(workspace_root)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_str().unwrap_or("");
            !name.starts_with('.')
                && !matches!(name, "build" | "target" | "out" | "bin" | "node_modules")
        })
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_str().unwrap_or("");
        if matches!(name, "build.gradle" | "build.gradle.kts" | "pom.xml")
            && let Some(parent) = entry.path().parent()
            && !roots.contains(&parent.to_path_buf())
        {
            roots.push(parent.to_path_buf());
        }
    }
    roots
}

/// `tower-lsp` adapter over a [`ServerCore`].
pub struct GroovyBackend {
    client: Client,
    compiler: Arc<dyn Compiler>,
    importers: Mutex<Vec<Arc<dyn Importer>>>,
    providers: Arc<dyn FeatureProviders>,
    core: OnceLock<Arc<ServerCore>>,
}

impl GroovyBackend {
    pub fn new(
        client: Client,
        compiler: Arc<dyn Compiler>,
        importers: Vec<Arc<dyn Importer>>,
        providers: Arc<dyn FeatureProviders>,
    ) -> Self {
        Self {
            client,
            compiler,
            importers: Mutex::new(importers),
            providers,
            core: OnceLock::new(),
        }
    }

    pub fn core(&self) -> Option<&Arc<ServerCore>> {
        self.core.get()
    }

    fn install_core(&self, options: ServerOptions, workspace_root: Option<PathBuf>) {
        let importers = std::mem::take(&mut *self.importers.lock());
        let sink: Arc<dyn ClientSink> = Arc::new(TowerLspSink::new(self.client.clone()));
        let core = ServerCore::build(
            Arc::clone(&self.compiler),
            importers,
            sink,
            CoreConfig {
                options,
                workspace_root,
                ..Default::default()
            },
        );
        core.start_sweeper();
        let _ = self.core.set(core);
    }
}

/// Builds the `tower-lsp` service with the custom `groovy/*` request
/// handlers registered.
pub fn build_service(
    compiler: Arc<dyn Compiler>,
    importers: Vec<Arc<dyn Importer>>,
    providers: Arc<dyn FeatureProviders>,
) -> (LspService<GroovyBackend>, ClientSocket) {
    LspService::build(move |client| {
        GroovyBackend::new(client, compiler, importers, providers)
    })
    .custom_method(
        "groovy/getProtocolVersion",
        GroovyBackend::get_protocol_version,
    )
    .custom_method(
        "groovy/getDecompiledContent",
        GroovyBackend::get_decompiled_content,
    )
    .finish()
}
