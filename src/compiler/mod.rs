//! The compiler facade: the black-box seam between the orchestrator and a
//! Groovy front-end.
//!
//! The orchestrator never parses source text. It hands a [`Compiler`] a
//! [`UnitConfig`] describing one project's input set, drives the resulting
//! [`CompilationUnit`] through [`CompilationUnit::compile`] and
//! [`CompilationUnit::visit`], and consumes the [`AstIndex`] the visit
//! produces. Everything the scheduling layer needs (diagnostics, per-file
//! node counts, declared class signatures, source-to-source references) is
//! carried in the index; the compiler's internal representation stays opaque.

pub mod ast;
pub mod class_graph;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tower_lsp::lsp_types::{Diagnostic, Url};

pub use ast::{AstIndex, ClassSignature, FieldSignature, FileAst, MethodSignature, Visibility};
pub use class_graph::{ScanCache, ScanHandle};

/// Input configuration for one compilation unit. The unit owns source
/// discovery for full compiles; `restricted_sources` short-circuits discovery
/// for incremental and single-file units.
#[derive(Debug, Clone, Default)]
pub struct UnitConfig {
    pub project_root: PathBuf,
    /// Roots of nested projects owned by other scopes; the unit must not
    /// pull sources from under these.
    pub excluded_sub_roots: Vec<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub language_version: Option<String>,
    /// Package prefixes excluded from compilation.
    pub rejected_packages: Vec<String>,
    /// When set, compile exactly these sources instead of discovering the
    /// project's source set.
    pub restricted_sources: Option<Vec<SourceEntry>>,
}

/// One source file handed to the compiler, optionally with live editor text
/// overriding the on-disk content.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub uri: Url,
    pub text: Option<Arc<String>>,
}

impl SourceEntry {
    pub fn from_disk(uri: Url) -> Self {
        Self { uri, text: None }
    }

    pub fn with_text(uri: Url, text: Arc<String>) -> Self {
        Self {
            uri,
            text: Some(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilePhase {
    /// Parse only: no classpath, no semantic resolution.
    SyntaxOnly,
    /// Full semantic compile against the unit's classpath.
    Full,
}

/// Result of a compile: per-URI diagnostics plus the set of URIs that carry
/// at least one error.
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub diagnostics_by_uri: HashMap<Url, Vec<Diagnostic>>,
    pub error_uris: HashSet<Url>,
}

impl CompileReport {
    pub fn is_clean(&self) -> bool {
        self.error_uris.is_empty()
    }
}

/// Failures that abort a compile. Per-file problems are diagnostics in the
/// report, not errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compiler ran out of memory ({used_mb} MB used of {max_mb} MB)")]
    OutOfMemory { used_mb: u64, max_mb: u64 },
    #[error("classpath entry failed to load: {0}")]
    Linkage(String),
    #[error("compilation interrupted")]
    Interrupted,
    #[error("compiler failure: {0}")]
    Internal(String),
}

/// The compiler's runtime resolver for classpath types. Owned by the scope
/// and disposed when replaced.
pub trait ClassLoader: Send + Sync {
    /// Stable identity; a changed id means the loader was replaced and any
    /// classpath index derived from it is stale.
    fn id(&self) -> u64;

    /// Releases resources held by the loader. Idempotent.
    fn dispose(&self);
}

/// The compiler's aggregate input for one compile invocation.
pub trait CompilationUnit: Send + Sync {
    /// Replaces the live-text overlay for open documents. Overlays win over
    /// disk content for matching URIs.
    fn set_overlays(&mut self, overlays: Vec<SourceEntry>);

    fn compile(&mut self, phase: CompilePhase) -> Result<CompileReport, CompileError>;

    /// Visits the compiled AST, producing per-file node data. `filter`
    /// restricts the visit to the given URIs; `None` visits everything the
    /// unit compiled.
    fn visit(&self, filter: Option<&HashSet<Url>>) -> AstIndex;

    /// The classpath resolver backing this unit.
    fn class_loader(&self) -> Arc<dyn ClassLoader>;
}

/// Factory for compilation units. One instance serves the whole server.
pub trait Compiler: Send + Sync + 'static {
    fn create_unit(&self, config: &UnitConfig) -> Box<dyn CompilationUnit>;

    /// Drops any per-root source listing cache the factory keeps, forcing the
    /// next unit to re-discover files on disk.
    fn invalidate_file_cache(&self, project_root: &Path);
}
