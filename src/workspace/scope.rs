//! Per-project scope state.
//!
//! A scope owns everything the server knows about one build-tool project:
//! its classpath, the compiler's input set and classloader, the published
//! AST index, the source dependency graph, and the lifecycle flags that
//! drive the compilation service.
//!
//! # Locking
//!
//! Heavy state lives under the scope's `tokio::sync::RwLock`. Mutation only
//! happens while holding the write guard; LSP read paths either take the
//! read guard or snapshot the atomically published AST pointer and proceed
//! lock-free (the index is replaced, never mutated in place, so a snapshot
//! is stale at worst, never torn). Lifecycle flags are plain atomics so the
//! router and sweeper can consult them without touching the lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tower_lsp::lsp_types::{Diagnostic, Url};
use tracing::debug;

use crate::compiler::{AstIndex, ClassLoader, CompilationUnit, ScanHandle};
use crate::workspace::DependencyGraph;

/// Classpath resolution lifecycle. Transitions are one-way except that a
/// failed resolution may be re-requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResolutionState {
    None = 0,
    Requested = 1,
    Resolving = 2,
    Resolved = 3,
    Failed = 4,
}

impl ResolutionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ResolutionState::Requested,
            2 => ResolutionState::Resolving,
            3 => ResolutionState::Resolved,
            4 => ResolutionState::Failed,
            _ => ResolutionState::None,
        }
    }
}

/// Heavy per-scope state, guarded by the scope's readers-writer lock.
#[derive(Default)]
pub struct ScopeState {
    pub classpath: Vec<PathBuf>,
    pub language_version: Option<String>,
    pub unit: Option<Box<dyn CompilationUnit>>,
    pub class_loader: Option<Arc<dyn ClassLoader>>,
    pub class_graph_scan: Option<ScanHandle>,
    pub dependency_graph: DependencyGraph,
}

impl ScopeState {
    /// Releases the compiler-owned resources (unit, classloader, scan). The
    /// dependency graph and classpath survive so a re-created scope does not
    /// need a fresh resolution.
    pub fn release_heavy(&mut self) {
        self.unit = None;
        if let Some(loader) = self.class_loader.take() {
            loader.dispose();
        }
        if let Some(scan) = self.class_graph_scan.take() {
            scan.release();
        }
    }
}

fn monotonic_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// One independently compiled project within the workspace.
pub struct ProjectScope {
    project_root: PathBuf,
    is_default: bool,
    excluded_sub_roots: Mutex<Vec<PathBuf>>,

    state: RwLock<ScopeState>,
    /// Published AST snapshot; readers may use this without the lock.
    ast: ArcSwapOption<AstIndex>,

    classpath_resolved: AtomicBool,
    compiled: AtomicBool,
    fully_compiled: AtomicBool,
    compilation_failed: AtomicBool,
    evicted: AtomicBool,
    resolution: AtomicU8,

    last_accessed_at: AtomicU64,

    /// Last published diagnostics per URI, used to clear stale entries.
    pub previous_diagnostics_by_uri: DashMap<Url, Vec<Diagnostic>>,
    /// Focus of the most recent LSP request against this scope.
    pub previous_context_uri: Mutex<Option<Url>>,
}

impl ProjectScope {
    pub fn new(project_root: PathBuf) -> Self {
        Self {
            project_root,
            is_default: false,
            excluded_sub_roots: Mutex::new(Vec::new()),
            state: RwLock::new(ScopeState::default()),
            ast: ArcSwapOption::empty(),
            classpath_resolved: AtomicBool::new(false),
            compiled: AtomicBool::new(false),
            fully_compiled: AtomicBool::new(false),
            compilation_failed: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            resolution: AtomicU8::new(ResolutionState::None as u8),
            last_accessed_at: AtomicU64::new(monotonic_millis()),
            previous_diagnostics_by_uri: DashMap::new(),
            previous_context_uri: Mutex::new(None),
        }
    }

    /// The fallback scope owning URIs no project claims. It compiles against
    /// the configured `groovy.classpath` and is always considered resolved.
    pub fn new_default(workspace_root: PathBuf) -> Self {
        let mut scope = Self::new(workspace_root);
        scope.is_default = true;
        scope.classpath_resolved.store(true, Ordering::Release);
        scope
            .resolution
            .store(ResolutionState::Resolved as u8, Ordering::Release);
        scope
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn excluded_sub_roots(&self) -> Vec<PathBuf> {
        self.excluded_sub_roots.lock().clone()
    }

    pub fn set_excluded_sub_roots(&self, roots: Vec<PathBuf>) {
        *self.excluded_sub_roots.lock() = roots;
    }

    pub fn state(&self) -> &RwLock<ScopeState> {
        &self.state
    }

    // Flag accessors. `fully_compiled ⇒ compiled` is maintained by the
    // setters, not trusted from callers.

    pub fn is_classpath_resolved(&self) -> bool {
        self.classpath_resolved.load(Ordering::Acquire)
    }

    pub fn set_classpath_resolved(&self, resolved: bool) {
        self.classpath_resolved.store(resolved, Ordering::Release);
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    pub fn set_compiled(&self, compiled: bool) {
        self.compiled.store(compiled, Ordering::Release);
        if !compiled {
            self.fully_compiled.store(false, Ordering::Release);
        }
    }

    pub fn is_fully_compiled(&self) -> bool {
        self.fully_compiled.load(Ordering::Acquire)
    }

    pub fn set_fully_compiled(&self) {
        self.compiled.store(true, Ordering::Release);
        self.fully_compiled.store(true, Ordering::Release);
    }

    pub fn is_compilation_failed(&self) -> bool {
        self.compilation_failed.load(Ordering::Acquire)
    }

    pub fn set_compilation_failed(&self, failed: bool) {
        self.compilation_failed.store(failed, Ordering::Release);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn set_evicted(&self, evicted: bool) {
        self.evicted.store(evicted, Ordering::Release);
        if evicted {
            self.set_compiled(false);
        }
    }

    /// Updates the access clock; called on any routed request or compile.
    pub fn touch(&self) {
        self.last_accessed_at
            .store(monotonic_millis(), Ordering::Release);
    }

    pub fn last_accessed_millis(&self) -> u64 {
        self.last_accessed_at.load(Ordering::Acquire)
    }

    pub fn idle_millis(&self) -> u64 {
        monotonic_millis().saturating_sub(self.last_accessed_millis())
    }

    pub fn resolution_state(&self) -> ResolutionState {
        ResolutionState::from_u8(self.resolution.load(Ordering::Acquire))
    }

    pub fn set_resolution_state(&self, state: ResolutionState) {
        self.resolution.store(state as u8, Ordering::Release);
    }

    /// Atomic test-and-set claiming this scope for resolution. Returns `true`
    /// only for the first claimant; concurrent requests and re-requests while
    /// a resolution is in flight are deduplicated here.
    pub fn mark_resolution_started(&self) -> bool {
        for current in [
            ResolutionState::None as u8,
            ResolutionState::Requested as u8,
            ResolutionState::Failed as u8,
        ] {
            if self
                .resolution
                .compare_exchange(
                    current,
                    ResolutionState::Resolving as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Lock-free snapshot of the published AST index.
    pub fn ast_snapshot(&self) -> Option<Arc<AstIndex>> {
        self.ast.load_full()
    }

    /// Publishes a replacement AST index. Callers hold the write lock.
    pub fn publish_ast(&self, index: Arc<AstIndex>) {
        self.ast.store(Some(index));
    }

    pub fn clear_ast(&self) {
        self.ast.store(None);
    }

    /// Evicts the scope's heavy state. The caller holds the write lock.
    pub fn evict(&self, state: &mut ScopeState) {
        state.release_heavy();
        self.clear_ast();
        self.set_evicted(true);
        debug!("evicted scope {}", self.project_root.display());
    }
}

impl std::fmt::Debug for ProjectScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectScope")
            .field("project_root", &self.project_root)
            .field("default", &self.is_default)
            .field("classpath_resolved", &self.is_classpath_resolved())
            .field("compiled", &self.is_compiled())
            .field("fully_compiled", &self.is_fully_compiled())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_compiled_implies_compiled() {
        let scope = ProjectScope::new(PathBuf::from("/p"));
        scope.set_fully_compiled();
        assert!(scope.is_compiled());
        assert!(scope.is_fully_compiled());

        scope.set_compiled(false);
        assert!(!scope.is_fully_compiled());
    }

    #[test]
    fn eviction_resets_compiled() {
        let scope = ProjectScope::new(PathBuf::from("/p"));
        scope.set_fully_compiled();
        scope.set_evicted(true);
        assert!(scope.is_evicted());
        assert!(!scope.is_compiled());
        assert!(!scope.is_fully_compiled());
    }

    #[test]
    fn resolution_claim_is_exclusive() {
        let scope = ProjectScope::new(PathBuf::from("/p"));
        assert!(scope.mark_resolution_started());
        assert!(!scope.mark_resolution_started());
        assert_eq!(scope.resolution_state(), ResolutionState::Resolving);

        scope.set_resolution_state(ResolutionState::Resolved);
        assert!(!scope.mark_resolution_started());
    }

    #[test]
    fn failed_resolution_can_be_reclaimed() {
        let scope = ProjectScope::new(PathBuf::from("/p"));
        assert!(scope.mark_resolution_started());
        scope.set_resolution_state(ResolutionState::Failed);
        assert!(scope.mark_resolution_started());
    }

    #[test]
    fn default_scope_is_born_resolved() {
        let scope = ProjectScope::new_default(PathBuf::from("/workspace"));
        assert!(scope.is_default());
        assert!(scope.is_classpath_resolved());
    }

    #[test]
    fn touch_advances_access_clock() {
        let scope = ProjectScope::new(PathBuf::from("/p"));
        let before = scope.last_accessed_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        scope.touch();
        assert!(scope.last_accessed_millis() >= before);
        assert!(scope.idle_millis() < 1_000);
    }

    #[test]
    fn ast_publish_and_snapshot() {
        let scope = ProjectScope::new(PathBuf::from("/p"));
        assert!(scope.ast_snapshot().is_none());

        let index = Arc::new(AstIndex::new());
        scope.publish_ast(Arc::clone(&index));
        assert!(Arc::ptr_eq(&scope.ast_snapshot().unwrap(), &index));

        scope.clear_ast();
        assert!(scope.ast_snapshot().is_none());
    }
}
