//! The compilation service: full, staged, and incremental pipelines.
//!
//! All compiles pass through the global permit semaphore, so no matter how
//! many scopes are active at once the compiler never sees more than the
//! configured number of concurrent invocations.
//!
//! # Pipelines
//!
//! - **Full**: rebuild the scope's compilation unit for its whole source
//!   set, compile, visit, rebuild the dependency graph, publish diagnostics.
//! - **Staged**: Phase A compiles just the triggering file synchronously so
//!   the user sees diagnostics immediately; Phase B is a deferred full
//!   compile on the background pool that replaces Phase A's AST.
//! - **Incremental**: for small edits, compile only the changed files plus
//!   their depth-2 forward closure. Sound only while class signatures are
//!   unchanged; an API change falls back to a full compile.
//!
//! # Failure policy
//!
//! A scope is marked `compiled` on every exit path (scopeguard), so a broken
//! compile never loops. Linkage failures keep the prior AST and stop
//! retrying until the classpath changes. Out-of-memory seals the scope: a
//! synthetic diagnostic lands on the build file, a prominent message reaches
//! the user, and no compile runs again until a classpath update clears the
//! seal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashSet;
use scopeguard::guard;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, MessageType, Position, Range, Url,
};
use tracing::{debug, error, info, warn};

use crate::compile::signatures;
use crate::compiler::{
    AstIndex, CompileError, CompilePhase, CompileReport, Compiler, SourceEntry, UnitConfig,
};
use crate::config::ServerOptions;
use crate::exec::TaskPools;
use crate::lsp::protocol::{ClientSink, StatusState};
use crate::memory::MemoryGauge;
use crate::workspace::FileContentsTracker;
use crate::workspace::file_contents::offset_at;
use crate::workspace::scope::{ProjectScope, ScopeState};

/// An incremental compile is only attempted for at most this many changed
/// files; beyond that a full compile is cheaper than chasing closures.
const INCREMENTAL_MAX_CHANGED: usize = 3;
/// Forward-dependency closure depth for incremental file sets.
const INCREMENTAL_CLOSURE_DEPTH: usize = 2;
/// Abort to full compile when the incremental file set grows past this.
const INCREMENTAL_MAX_FILES: usize = 50;

const DIAGNOSTIC_SOURCE: &str = "groovy";

pub struct CompilationService {
    compiler: Arc<dyn Compiler>,
    contents: Arc<FileContentsTracker>,
    pools: Arc<TaskPools>,
    sink: Arc<dyn ClientSink>,
    gauge: Arc<dyn MemoryGauge>,
    options: Arc<ServerOptions>,
}

impl CompilationService {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        contents: Arc<FileContentsTracker>,
        pools: Arc<TaskPools>,
        sink: Arc<dyn ClientSink>,
        gauge: Arc<dyn MemoryGauge>,
        options: Arc<ServerOptions>,
    ) -> Self {
        Self {
            compiler,
            contents,
            pools,
            sink,
            gauge,
            options,
        }
    }

    /// Brings an uncompiled scope up. The caller holds the scope write lock.
    ///
    /// Returns `true` iff a compilation was launched. Already-compiled,
    /// sealed, and classpath-unresolved scopes are a no-op; the last is a
    /// normal outcome, not an error; callers route to resolution instead.
    ///
    /// With a trigger URI and `staged` set, Phase A compiles just the
    /// trigger synchronously and Phase B schedules the full compile on the
    /// background pool.
    pub async fn ensure_scope_compiled(
        self: &Arc<Self>,
        scope: &Arc<ProjectScope>,
        state: &mut ScopeState,
        trigger: Option<&Url>,
        staged: bool,
    ) -> bool {
        if scope.is_evicted() {
            // Transparent re-creation: the flag clears and the compile below
            // rebuilds everything the eviction released.
            scope.set_evicted(false);
        }
        if scope.is_compiled() || scope.is_compilation_failed() || !scope.is_classpath_resolved() {
            return false;
        }

        match (trigger, staged) {
            (Some(trigger), true) => {
                // The status bar shows the whole staged span: Phase A here,
                // Ready once Phase B lands.
                self.sink.status_update(
                    StatusState::Importing,
                    format!("Compiling {}", scope.project_root().display()),
                );
                self.compile_single_file(scope, state, trigger).await;
                scope.set_compiled(true);
                self.spawn_full_compile(Arc::clone(scope));
                true
            }
            _ => {
                self.compile_fully(scope, state).await;
                true
            }
        }
    }

    /// Phase B and deferred rebuilds: a full compile on the background pool
    /// that takes the write lock itself. Reports Ready when the scope is
    /// settled, closing the transition opened by Phase A.
    pub fn spawn_full_compile(self: &Arc<Self>, scope: Arc<ProjectScope>) {
        let service = Arc::clone(self);
        let root = scope.project_root().to_path_buf();
        self.pools.background.spawn(&root, async move {
            let mut state = scope.state().write().await;
            if !scope.is_fully_compiled() && !scope.is_compilation_failed() {
                service.compile_fully(&scope, &mut state).await;
            }
            service
                .sink
                .status_update(StatusState::Ready, String::new());
            Ok(())
        });
    }

    /// Full-project compilation. The caller holds the scope write lock.
    /// Returns `true` on success (AST published, `fully_compiled` set).
    pub async fn compile_fully(&self, scope: &Arc<ProjectScope>, state: &mut ScopeState) -> bool {
        scope.touch();
        let compiled_flag = guard(Arc::clone(scope), |scope| scope.set_compiled(true));

        let config = self.unit_config(scope, state, None);
        let mut unit = self.compiler.create_unit(&config);
        unit.set_overlays(self.open_overlays_under(scope.project_root()));

        // A fresh unit brings a fresh classloader; dispose the replaced one
        // and drop the classpath scan derived from it.
        let new_loader = unit.class_loader();
        if let Some(old_loader) = state.class_loader.take() {
            if old_loader.id() != new_loader.id() {
                old_loader.dispose();
                if let Some(scan) = state.class_graph_scan.take() {
                    scan.release();
                }
            }
        }
        state.class_loader = Some(new_loader);
        state.unit = Some(unit);

        let changed_under_root = self.contents.changed_uris_under(scope.project_root());
        self.contents.reset_changed(changed_under_root.iter());

        let Some(permit) = self.pools.acquire_compile_permit().await else {
            debug!(
                "compile permit unavailable (shutdown), skipping {}",
                scope.project_root().display()
            );
            return false;
        };
        let result = match state.unit.as_mut() {
            Some(unit) => unit.compile(CompilePhase::Full),
            None => return false,
        };
        drop(permit);

        match result {
            Ok(report) => {
                let Some(unit) = state.unit.as_ref() else {
                    return false;
                };
                let mut index = unit.visit(None);
                self.retain_last_known_good(scope, &report, &mut index);

                state.dependency_graph.clear();
                for (uri, file) in index.iter() {
                    state
                        .dependency_graph
                        .update_dependencies(uri, file.references.clone());
                }

                scope.publish_ast(Arc::new(index));
                self.publish_report(scope, &report, None);
                drop(compiled_flag);
                scope.set_fully_compiled();
                info!(
                    "full compile of {} finished ({} error file(s))",
                    scope.project_root().display(),
                    report.error_uris.len()
                );
                true
            }
            Err(CompileError::Linkage(message)) => {
                // A classpath entry failed to load. Keep the prior AST and
                // stop retrying until the classpath changes.
                warn!(
                    "linkage failure compiling {}: {}",
                    scope.project_root().display(),
                    message
                );
                false
            }
            Err(CompileError::OutOfMemory { used_mb, max_mb }) => {
                self.handle_oom(scope, used_mb, max_mb);
                false
            }
            Err(CompileError::Interrupted) => {
                debug!(
                    "compile of {} interrupted",
                    scope.project_root().display()
                );
                false
            }
            Err(CompileError::Internal(message)) => {
                warn!(
                    "compiler failure in {}: {}",
                    scope.project_root().display(),
                    message
                );
                false
            }
        }
    }

    /// The standard recompile path for an already-compiled scope: try
    /// incremental, fall back to full. The caller holds the write lock.
    pub async fn update_and_recompile(
        self: &Arc<Self>,
        scope: &Arc<ProjectScope>,
        state: &mut ScopeState,
        context: Option<&Url>,
    ) -> bool {
        if scope.is_compilation_failed() || !scope.is_classpath_resolved() {
            return false;
        }
        if !scope.is_compiled() {
            return self
                .ensure_scope_compiled(scope, state, context, false)
                .await;
        }

        let changed = self.contents.changed_uris_under(scope.project_root());
        if changed.is_empty() && context.is_none() {
            return false;
        }

        let incremental_viable = changed.len() <= INCREMENTAL_MAX_CHANGED
            && scope.ast_snapshot().is_some()
            && !state.dependency_graph.is_empty();
        if incremental_viable
            && self
                .compile_incrementally(scope, state, &changed, context)
                .await
        {
            return true;
        }
        if scope.is_compilation_failed() {
            // The incremental attempt hit OOM and sealed the scope.
            return true;
        }
        self.compile_fully(scope, state).await
    }

    /// Incremental compilation of the changed files plus their depth-bounded
    /// forward closure. Returns `false` when the caller must fall back to a
    /// full compile (file set too large, compile failure, or API change).
    async fn compile_incrementally(
        &self,
        scope: &Arc<ProjectScope>,
        state: &mut ScopeState,
        changed: &[Url],
        context: Option<&Url>,
    ) -> bool {
        let mut seeds: FxHashSet<Url> = changed.iter().cloned().collect();
        if let Some(context) = context {
            seeds.insert(context.clone());
        }
        if seeds.is_empty() {
            return false;
        }

        let mut files = seeds.clone();
        files.extend(
            state
                .dependency_graph
                .transitive_dependencies(seeds.iter(), INCREMENTAL_CLOSURE_DEPTH),
        );
        if files.len() > INCREMENTAL_MAX_FILES {
            debug!(
                "incremental set of {} files exceeds limit, falling back to full",
                files.len()
            );
            return false;
        }

        let previous_ast = scope.ast_snapshot();
        let old_signatures = signatures::capture(previous_ast.as_deref(), seeds.iter());

        let sources: Vec<SourceEntry> = files.iter().map(|uri| self.source_entry(uri)).collect();
        let config = self.unit_config(scope, state, Some(sources));
        let mut unit = self.compiler.create_unit(&config);

        let Some(permit) = self.pools.acquire_compile_permit().await else {
            return false;
        };
        let result = unit.compile(CompilePhase::Full);
        drop(permit);

        let report = match result {
            Ok(report) => report,
            Err(CompileError::OutOfMemory { used_mb, max_mb }) => {
                self.handle_oom(scope, used_mb, max_mb);
                return false;
            }
            Err(e) => {
                debug!("incremental compile failed ({}), falling back to full", e);
                return false;
            }
        };

        let visit_set: HashSet<Url> = seeds.iter().cloned().collect();
        let visited = unit.visit(Some(&visit_set));
        let new_signatures = signatures::capture(Some(&visited), seeds.iter());
        if !signatures::unchanged(&old_signatures, &new_signatures) {
            debug!("class signature change detected, falling back to full compile");
            return false;
        }

        for (uri, file) in visited.iter() {
            state
                .dependency_graph
                .update_dependencies(uri, file.references.clone());
        }
        let merged = match previous_ast {
            Some(previous) => previous.with_updates(visited),
            None => visited,
        };
        scope.publish_ast(Arc::new(merged));

        self.contents.reset_changed(changed.iter());
        self.publish_report(scope, &report, Some(&visit_set));
        scope.touch();
        debug!(
            "incremental compile of {} file(s) in {} succeeded",
            files.len(),
            scope.project_root().display()
        );
        true
    }

    /// Phase A: compile only the trigger file so its diagnostics appear
    /// immediately. The full-project state is left to Phase B.
    async fn compile_single_file(
        &self,
        scope: &Arc<ProjectScope>,
        state: &mut ScopeState,
        trigger: &Url,
    ) {
        let sources = vec![self.source_entry(trigger)];
        let config = self.unit_config(scope, state, Some(sources));
        let mut unit = self.compiler.create_unit(&config);

        let Some(permit) = self.pools.acquire_compile_permit().await else {
            return;
        };
        let result = unit.compile(CompilePhase::Full);
        drop(permit);

        match result {
            Ok(report) => {
                let visit_set: HashSet<Url> = std::iter::once(trigger.clone()).collect();
                let visited = unit.visit(Some(&visit_set));
                for (uri, file) in visited.iter() {
                    state
                        .dependency_graph
                        .update_dependencies(uri, file.references.clone());
                }
                let merged = match scope.ast_snapshot() {
                    Some(previous) => previous.with_updates(visited),
                    None => visited,
                };
                scope.publish_ast(Arc::new(merged));
                self.publish_report(scope, &report, Some(&visit_set));
            }
            Err(CompileError::OutOfMemory { used_mb, max_mb }) => {
                self.handle_oom(scope, used_mb, max_mb);
            }
            Err(e) => {
                debug!("single-file compile of {} failed: {}", trigger, e);
            }
        }
    }

    /// Parse-only diagnostics for a file whose scope has no classpath yet.
    /// Runs on the background pool.
    pub fn syntax_check_single_file(self: &Arc<Self>, scope: Arc<ProjectScope>, uri: Url) {
        let service = Arc::clone(self);
        let root = scope.project_root().to_path_buf();
        self.pools.background.spawn(&root, async move {
            let sources = vec![service.source_entry(&uri)];
            let config = UnitConfig {
                project_root: scope.project_root().to_path_buf(),
                excluded_sub_roots: scope.excluded_sub_roots(),
                // No classpath: the parse phase needs none.
                classpath: Vec::new(),
                language_version: None,
                rejected_packages: service.options.rejected_packages.clone(),
                restricted_sources: Some(sources),
            };
            let mut unit = service.compiler.create_unit(&config);
            match unit.compile(CompilePhase::SyntaxOnly) {
                Ok(report) => {
                    let visit_set: HashSet<Url> = std::iter::once(uri).collect();
                    service.publish_report(&scope, &report, Some(&visit_set));
                    Ok(())
                }
                Err(e) => {
                    debug!("syntax-only check failed: {}", e);
                    Ok(())
                }
            }
        });
    }

    /// Guarantees an AST node under the cursor for completion and signature
    /// help. When the position maps to no node, the source is recompiled
    /// with a synthetic identifier (and any missing closing delimiters)
    /// spliced in at the cursor; afterwards the document is marked dirty so
    /// the next access recompiles the real text.
    ///
    /// The caller holds the scope write lock. Returns `true` when a node
    /// covers the position afterwards.
    pub async fn ensure_ast_for_position(
        &self,
        scope: &Arc<ProjectScope>,
        state: &mut ScopeState,
        uri: &Url,
        position: Position,
    ) -> bool {
        if let Some(ast) = scope.ast_snapshot()
            && ast.node_at(uri, position)
        {
            return true;
        }
        let Some(text) = self.contents.get_contents(uri) else {
            return false;
        };

        let synthetic = inject_placeholder(&text, position);
        let sources = vec![SourceEntry::with_text(uri.clone(), Arc::new(synthetic))];
        let config = self.unit_config(scope, state, Some(sources));
        let mut unit = self.compiler.create_unit(&config);

        let Some(permit) = self.pools.acquire_compile_permit().await else {
            return false;
        };
        let result = unit.compile(CompilePhase::Full);
        drop(permit);

        if result.is_err() {
            return false;
        }
        let visit_set: HashSet<Url> = std::iter::once(uri.clone()).collect();
        let visited = unit.visit(Some(&visit_set));
        let merged = match scope.ast_snapshot() {
            Some(previous) => previous.with_updates(visited),
            None => visited,
        };
        scope.publish_ast(Arc::new(merged));

        // The published AST reflects the synthetic text; defer the real
        // recompile to the next access.
        self.contents.force_changed([uri.clone()]);

        scope
            .ast_snapshot()
            .is_some_and(|ast| ast.node_at(uri, position))
    }

    /// Seals a scope after an out-of-memory failure: no retries until a
    /// classpath update clears the seal, a synthetic diagnostic lands on the
    /// build file, and the user gets a prominent message.
    pub fn handle_oom(&self, scope: &Arc<ProjectScope>, used_mb: u64, max_mb: u64) {
        error!(
            "out of memory compiling {} ({} MB used of {} MB)",
            scope.project_root().display(),
            used_mb,
            max_mb
        );
        scope.set_compilation_failed(true);
        scope.set_compiled(true);

        let build_file = build_file_of(scope.project_root());
        let message = format!(
            "The Groovy compiler ran out of memory compiling this project \
             ({used_mb} MB used of {max_mb} MB). Increase the language server's \
             maximum heap (e.g. via groovy.ls.maxHeapMB) and reopen the project; \
             compilation is disabled for this project until then."
        );
        if let Ok(uri) = Url::from_file_path(&build_file) {
            let diagnostic = Diagnostic {
                range: Range::new(Position::new(0, 0), Position::new(0, 1)),
                severity: Some(DiagnosticSeverity::ERROR),
                source: Some(DIAGNOSTIC_SOURCE.to_string()),
                message: message.clone(),
                ..Default::default()
            };
            scope
                .previous_diagnostics_by_uri
                .insert(uri.clone(), vec![diagnostic.clone()]);
            self.sink.publish_diagnostics(uri, vec![diagnostic], None);
        }
        self.sink.show_message(MessageType::ERROR, message);

        // Current usage according to the gauge, for the log trail.
        debug!(
            "gauge reads {} MB used of {} MB",
            self.gauge.used_mb(),
            self.gauge.max_mb()
        );
    }

    /// Clears published diagnostics for a URI (deleted file, stale entry).
    pub fn clear_diagnostics(&self, uri: &Url) {
        self.sink.publish_diagnostics(uri.clone(), Vec::new(), None);
    }

    /// Publishes a report's diagnostics and clears stale entries from the
    /// previous publication. With a visit filter only filtered URIs are
    /// cleared; a full compile clears everything the report no longer
    /// mentions.
    fn publish_report(
        &self,
        scope: &Arc<ProjectScope>,
        report: &CompileReport,
        visited: Option<&HashSet<Url>>,
    ) {
        for (uri, diagnostics) in &report.diagnostics_by_uri {
            scope
                .previous_diagnostics_by_uri
                .insert(uri.clone(), diagnostics.clone());
            self.sink.publish_diagnostics(
                uri.clone(),
                diagnostics.clone(),
                self.contents.open_version(uri),
            );
        }

        let stale: Vec<Url> = scope
            .previous_diagnostics_by_uri
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|uri| !report.diagnostics_by_uri.contains_key(uri))
            .filter(|uri| visited.is_none_or(|visited| visited.contains(uri)))
            .collect();
        for uri in stale {
            scope.previous_diagnostics_by_uri.remove(&uri);
            self.sink
                .publish_diagnostics(uri.clone(), Vec::new(), self.contents.open_version(&uri));
        }
    }

    /// Restores per-URI AST data from the previous visitor for errored files
    /// whose fresh visit collapsed; a transient syntax break should not
    /// blank out navigation and semantic tokens.
    fn retain_last_known_good(
        &self,
        scope: &Arc<ProjectScope>,
        report: &CompileReport,
        index: &mut AstIndex,
    ) {
        let Some(previous) = scope.ast_snapshot() else {
            return;
        };
        let ratio = self.options.ast_retention_ratio;
        for uri in &report.error_uris {
            let Some(previous_file) = previous.file(uri) else {
                continue;
            };
            let new_count = index.file(uri).map(|file| file.node_count).unwrap_or(0);
            let collapsed = (new_count == 0 && previous_file.node_count > 0)
                || (new_count as f64 * ratio) <= previous_file.node_count as f64;
            if collapsed {
                debug!(
                    "retaining previous AST for {} ({} nodes, fresh visit produced {})",
                    uri, previous_file.node_count, new_count
                );
                index.insert(uri.clone(), previous_file.clone());
            }
        }
    }

    fn unit_config(
        &self,
        scope: &Arc<ProjectScope>,
        state: &ScopeState,
        restricted_sources: Option<Vec<SourceEntry>>,
    ) -> UnitConfig {
        UnitConfig {
            project_root: scope.project_root().to_path_buf(),
            excluded_sub_roots: scope.excluded_sub_roots(),
            classpath: state.classpath.clone(),
            language_version: state.language_version.clone(),
            rejected_packages: self.options.rejected_packages.clone(),
            restricted_sources,
        }
    }

    fn source_entry(&self, uri: &Url) -> SourceEntry {
        match self.contents.get_contents(uri) {
            Some(text) => SourceEntry::with_text(uri.clone(), text),
            None => SourceEntry::from_disk(uri.clone()),
        }
    }

    fn open_overlays_under(&self, root: &Path) -> Vec<SourceEntry> {
        self.contents
            .open_uris()
            .into_iter()
            .filter(|uri| {
                uri.to_file_path()
                    .map(|path| path.starts_with(root))
                    .unwrap_or(false)
            })
            .filter_map(|uri| {
                self.contents
                    .get_contents(&uri)
                    .map(|text| SourceEntry::with_text(uri, text))
            })
            .collect()
    }
}

/// The project's build descriptor, best effort: the synthetic OOM diagnostic
/// needs somewhere visible to land.
fn build_file_of(project_root: &Path) -> PathBuf {
    for candidate in ["build.gradle", "build.gradle.kts", "pom.xml"] {
        let path = project_root.join(candidate);
        if path.exists() {
            return path;
        }
    }
    project_root.join("build.gradle")
}

/// Splices a synthetic identifier at the cursor and appends any missing
/// closing delimiters, giving the parser something well-shaped to hang a
/// node on.
fn inject_placeholder(text: &str, position: Position) -> String {
    let offset = offset_at(text, position);
    let mut synthetic = String::with_capacity(text.len() + 16);
    synthetic.push_str(&text[..offset]);
    synthetic.push_str("__cursor__");
    synthetic.push_str(&text[offset..]);

    for (open, close) in [('{', '}'), ('(', ')'), ('[', ']')] {
        let unbalanced = synthetic.chars().filter(|&c| c == open).count()
            as i64
            - synthetic.chars().filter(|&c| c == close).count() as i64;
        for _ in 0..unbalanced.max(0) {
            synthetic.push(close);
        }
    }
    synthetic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_injection_inserts_identifier_and_closers() {
        let text = "class A {\n  void run() {\n    this.\n";
        let synthetic = inject_placeholder(text, Position::new(2, 9));
        assert!(synthetic.contains("this.__cursor__"));
        let opens = synthetic.chars().filter(|&c| c == '{').count();
        let closes = synthetic.chars().filter(|&c| c == '}').count();
        assert_eq!(opens, closes);
    }

    #[test]
    fn build_file_defaults_to_gradle() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            build_file_of(dir.path()),
            dir.path().join("build.gradle")
        );
        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        assert_eq!(build_file_of(dir.path()), dir.path().join("pom.xml"));
    }
}
