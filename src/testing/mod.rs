//! Test support: a scriptable mock compiler, a mock importer, and a
//! recording client sink.
//!
//! The mock compiler understands a tiny line-oriented source format, enough
//! to exercise every orchestrator path without a real front-end:
//!
//! ```text
//! class Service            // declares a public class
//! extends Base             // supertype of the last class
//! method run(String)       // public method on the last class
//! private method helper()  // private member (invisible to signatures)
//! field count int          // public field
//! uses Util.groovy         // reference to a sibling file (dependency edge)
//! broken                   // syntax error: error diagnostic, visit collapses
//! ```
//!
//! Lives in the crate (not a dev-dependency) so integration tests, unit
//! tests, and downstream consumers share one implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, MessageType, Position, Range, Url,
};
use walkdir::WalkDir;

use crate::compiler::{
    AstIndex, ClassLoader, ClassSignature, CompilationUnit, CompileError, CompilePhase,
    CompileReport, Compiler, FieldSignature, FileAst, MethodSignature, SourceEntry, UnitConfig,
    Visibility,
};
use crate::lsp::protocol::{ClientSink, MemoryUsageParams, StatusState, StatusUpdateParams};
use crate::resolve::Importer;

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

/// Captures everything the server would have sent to the editor.
#[derive(Default)]
pub struct RecordingSink {
    diagnostics: Mutex<Vec<(Url, Vec<Diagnostic>)>>,
    statuses: Mutex<Vec<StatusUpdateParams>>,
    memory: Mutex<Vec<MemoryUsageParams>>,
    messages: Mutex<Vec<(MessageType, String)>>,
    logs: Mutex<Vec<(MessageType, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent publication for a URI, if any.
    pub fn latest_diagnostics(&self, uri: &Url) -> Option<Vec<Diagnostic>> {
        self.diagnostics
            .lock()
            .iter()
            .rev()
            .find(|(published, _)| published == uri)
            .map(|(_, diagnostics)| diagnostics.clone())
    }

    pub fn publication_count(&self, uri: &Url) -> usize {
        self.diagnostics
            .lock()
            .iter()
            .filter(|(published, _)| published == uri)
            .count()
    }

    pub fn statuses(&self) -> Vec<StatusUpdateParams> {
        self.statuses.lock().clone()
    }

    pub fn memory_reports(&self) -> Vec<MemoryUsageParams> {
        self.memory.lock().clone()
    }

    pub fn shown_messages(&self) -> Vec<(MessageType, String)> {
        self.messages.lock().clone()
    }

    pub fn log_messages(&self) -> Vec<(MessageType, String)> {
        self.logs.lock().clone()
    }
}

impl ClientSink for RecordingSink {
    fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, _version: Option<i32>) {
        self.diagnostics.lock().push((uri, diagnostics));
    }

    fn status_update(&self, state: StatusState, message: String) {
        self.statuses.lock().push(StatusUpdateParams { state, message });
    }

    fn memory_usage(&self, params: MemoryUsageParams) {
        self.memory.lock().push(params);
    }

    fn show_message(&self, typ: MessageType, message: String) {
        self.messages.lock().push((typ, message));
    }

    fn log_message(&self, typ: MessageType, message: String) {
        self.logs.lock().push((typ, message));
    }
}

// ---------------------------------------------------------------------------
// Mock compiler
// ---------------------------------------------------------------------------

static LOADER_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct MockLoader {
    id: u64,
    disposed: std::sync::atomic::AtomicBool,
}

impl ClassLoader for MockLoader {
    fn id(&self) -> u64 {
        self.id
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct ParsedFile {
    classes: Vec<ClassSignature>,
    references: FxHashSet<Url>,
    node_count: usize,
    diagnostics: Vec<Diagnostic>,
    broken: bool,
}

fn parse_mock_source(uri: &Url, text: &str) -> ParsedFile {
    let base = uri.to_file_path().ok().and_then(|p| p.parent().map(Path::to_path_buf));
    let mut parsed = ParsedFile::default();

    for (line_number, raw_line) in text.lines().enumerate() {
        let line = raw_line.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line == "broken" {
            parsed.broken = true;
            parsed.diagnostics.push(Diagnostic {
                range: Range::new(
                    Position::new(line_number as u32, 0),
                    Position::new(line_number as u32, 6),
                ),
                severity: Some(DiagnosticSeverity::ERROR),
                source: Some("groovy".to_string()),
                message: "unexpected token: broken".to_string(),
                ..Default::default()
            });
            continue;
        }

        let (visibility, line) = match line.strip_prefix("private ") {
            Some(rest) => (Visibility::Private, rest),
            None => (Visibility::Public, line),
        };

        if let Some(name) = line.strip_prefix("class ") {
            let mut class = ClassSignature::new(name.trim());
            class.visibility = visibility;
            parsed.classes.push(class);
        } else if let Some(name) = line.strip_prefix("extends ") {
            if let Some(class) = parsed.classes.last_mut() {
                class.supertypes.insert(name.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix("method ") {
            if let Some(class) = parsed.classes.last_mut() {
                let (name, parameters) = rest.split_once('(').unwrap_or((rest, ")"));
                let parameter_types = parameters
                    .trim_end_matches(')')
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
                class.methods.insert(MethodSignature {
                    name: name.trim().to_string(),
                    return_type: "void".to_string(),
                    parameter_types,
                    visibility,
                });
            }
        } else if let Some(rest) = line.strip_prefix("field ") {
            if let Some(class) = parsed.classes.last_mut() {
                let mut parts = rest.split_whitespace();
                let name = parts.next().unwrap_or("field").to_string();
                let type_name = parts.next().unwrap_or("def").to_string();
                class.fields.insert(FieldSignature {
                    name,
                    type_name,
                    visibility,
                });
            }
        } else if let Some(target) = line.strip_prefix("uses ") {
            if let Some(base) = &base
                && let Ok(reference) = Url::from_file_path(base.join(target.trim()))
            {
                parsed.references.insert(reference);
            }
        }
        if !parsed.broken {
            parsed.node_count += 10;
        }
    }

    if parsed.broken {
        // A parse collapse: no usable declarations survive.
        parsed.classes.clear();
        parsed.references.clear();
        parsed.node_count = 0;
    }
    parsed
}

struct MockUnit {
    config: UnitConfig,
    compiler: Arc<MockCompilerInner>,
    overlays: HashMap<Url, Arc<String>>,
    parsed: HashMap<Url, ParsedFile>,
    loader: Arc<MockLoader>,
}

impl MockUnit {
    fn source_text(&self, entry: &SourceEntry) -> Option<String> {
        if let Some(overlay) = self.overlays.get(&entry.uri) {
            return Some(overlay.as_ref().clone());
        }
        if let Some(text) = &entry.text {
            return Some(text.as_ref().clone());
        }
        let path = entry.uri.to_file_path().ok()?;
        std::fs::read_to_string(path).ok()
    }

    fn discover_sources(&self) -> Vec<SourceEntry> {
        if let Some(restricted) = &self.config.restricted_sources {
            return restricted.clone();
        }
        let mut sources = Vec::new();
        for entry in WalkDir::new(&self.config.project_root)
            .into_iter()
            .filter_entry(|e| {
                !e.file_name()
                    .to_str()
                    .is_some_and(|name| matches!(name, "build" | "target" | ".gradle" | "out" | "bin"))
            })
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().is_none_or(|ext| ext != "groovy")
            {
                continue;
            }
            if self
                .config
                .excluded_sub_roots
                .iter()
                .any(|excluded| path.starts_with(excluded))
            {
                continue;
            }
            if let Ok(uri) = Url::from_file_path(path) {
                sources.push(SourceEntry::from_disk(uri));
            }
        }
        sources
    }
}

impl CompilationUnit for MockUnit {
    fn set_overlays(&mut self, overlays: Vec<SourceEntry>) {
        for entry in overlays {
            if let Some(text) = entry.text {
                self.overlays.insert(entry.uri, text);
            }
        }
    }

    fn compile(&mut self, phase: CompilePhase) -> Result<CompileReport, CompileError> {
        self.compiler.compile_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.compiler.failure_queue.lock().pop() {
            return Err(error);
        }

        self.parsed.clear();
        let mut report = CompileReport::default();
        for entry in self.discover_sources() {
            let Some(text) = self.source_text(&entry) else {
                continue;
            };
            let parsed = parse_mock_source(&entry.uri, &text);
            if !parsed.diagnostics.is_empty() {
                report
                    .diagnostics_by_uri
                    .insert(entry.uri.clone(), parsed.diagnostics.clone());
            }
            if parsed.broken {
                report.error_uris.insert(entry.uri.clone());
            }
            if phase == CompilePhase::Full {
                self.parsed.insert(entry.uri.clone(), parsed);
            } else {
                // Syntax-only compiles produce no visitable AST.
                self.parsed.insert(
                    entry.uri.clone(),
                    ParsedFile {
                        diagnostics: parsed.diagnostics,
                        broken: parsed.broken,
                        ..Default::default()
                    },
                );
            }
        }
        Ok(report)
    }

    fn visit(&self, filter: Option<&HashSet<Url>>) -> AstIndex {
        self.parsed
            .iter()
            .filter(|(uri, _)| filter.is_none_or(|filter| filter.contains(uri)))
            .map(|(uri, parsed)| {
                let file = FileAst {
                    node_count: parsed.node_count,
                    classes: parsed.classes.clone(),
                    references: parsed.references.clone(),
                    covered_ranges: if parsed.node_count > 0 {
                        vec![Range::new(
                            Position::new(0, 0),
                            Position::new(u32::MAX, 0),
                        )]
                    } else {
                        Vec::new()
                    },
                };
                (uri.clone(), file)
            })
            .collect()
    }

    fn class_loader(&self) -> Arc<dyn ClassLoader> {
        Arc::clone(&self.loader) as Arc<dyn ClassLoader>
    }
}

#[derive(Default)]
struct MockCompilerInner {
    compile_count: AtomicUsize,
    unit_count: AtomicUsize,
    failure_queue: Mutex<Vec<CompileError>>,
    created_configs: Mutex<Vec<UnitConfig>>,
    invalidated_roots: Mutex<Vec<PathBuf>>,
}

/// Compiler front-end double driven by the mock source format.
#[derive(Default)]
pub struct MockCompiler {
    inner: Arc<MockCompilerInner>,
}

impl MockCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error for the next compile invocation.
    pub fn fail_next(&self, error: CompileError) {
        self.inner.failure_queue.lock().push(error);
    }

    pub fn compile_count(&self) -> usize {
        self.inner.compile_count.load(Ordering::SeqCst)
    }

    pub fn unit_count(&self) -> usize {
        self.inner.unit_count.load(Ordering::SeqCst)
    }

    pub fn created_configs(&self) -> Vec<UnitConfig> {
        self.inner.created_configs.lock().clone()
    }

    pub fn invalidated_roots(&self) -> Vec<PathBuf> {
        self.inner.invalidated_roots.lock().clone()
    }
}

impl Compiler for MockCompiler {
    fn create_unit(&self, config: &UnitConfig) -> Box<dyn CompilationUnit> {
        self.inner.unit_count.fetch_add(1, Ordering::SeqCst);
        self.inner.created_configs.lock().push(config.clone());
        Box::new(MockUnit {
            config: config.clone(),
            compiler: Arc::clone(&self.inner),
            overlays: HashMap::new(),
            parsed: HashMap::new(),
            loader: Arc::new(MockLoader {
                id: LOADER_IDS.fetch_add(1, Ordering::SeqCst),
                disposed: std::sync::atomic::AtomicBool::new(false),
            }),
        })
    }

    fn invalidate_file_cache(&self, project_root: &Path) {
        self.inner
            .invalidated_roots
            .lock()
            .push(project_root.to_path_buf());
    }
}

// ---------------------------------------------------------------------------
// Mock importer
// ---------------------------------------------------------------------------

/// Importer double with programmable classpaths and call recording.
pub struct MockImporter {
    name: String,
    handles_only: Mutex<Option<PathBuf>>,
    classpaths: Mutex<HashMap<PathBuf, Vec<PathBuf>>>,
    batching_root: Mutex<Option<PathBuf>>,
    mark_resolved: Mutex<bool>,
    language_version: Mutex<Option<String>>,
    resolve_delay: Mutex<Duration>,
    resolve_calls: Mutex<Vec<PathBuf>>,
    batch_calls: Mutex<Vec<(PathBuf, Vec<PathBuf>)>>,
    recompile_calls: Mutex<Vec<PathBuf>>,
    source_jar_calls: AtomicUsize,
}

impl MockImporter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handles_only: Mutex::new(None),
            classpaths: Mutex::new(HashMap::new()),
            batching_root: Mutex::new(None),
            mark_resolved: Mutex::new(true),
            language_version: Mutex::new(None),
            resolve_delay: Mutex::new(Duration::ZERO),
            resolve_calls: Mutex::new(Vec::new()),
            batch_calls: Mutex::new(Vec::new()),
            recompile_calls: Mutex::new(Vec::new()),
            source_jar_calls: AtomicUsize::new(0),
        }
    }

    pub fn handling_only(self, root: &str) -> Self {
        *self.handles_only.lock() = Some(PathBuf::from(root));
        self
    }

    pub fn with_classpath(self, root: &Path, classpath: Vec<PathBuf>) -> Self {
        self.classpaths.lock().insert(root.to_path_buf(), classpath);
        self
    }

    pub fn with_batching(self, build_tool_root: &Path) -> Self {
        *self.batching_root.lock() = Some(build_tool_root.to_path_buf());
        self
    }

    pub fn with_mark_resolved(self, mark: bool) -> Self {
        *self.mark_resolved.lock() = mark;
        self
    }

    pub fn with_language_version(self, version: &str) -> Self {
        *self.language_version.lock() = Some(version.to_string());
        self
    }

    pub fn with_resolve_delay(self, delay: Duration) -> Self {
        *self.resolve_delay.lock() = delay;
        self
    }

    pub fn set_classpath(&self, root: &Path, classpath: Vec<PathBuf>) {
        self.classpaths.lock().insert(root.to_path_buf(), classpath);
    }

    pub fn resolve_calls(&self) -> Vec<PathBuf> {
        self.resolve_calls.lock().clone()
    }

    pub fn batch_calls(&self) -> Vec<(PathBuf, Vec<PathBuf>)> {
        self.batch_calls.lock().clone()
    }

    pub fn recompile_calls(&self) -> Vec<PathBuf> {
        self.recompile_calls.lock().clone()
    }

    pub fn source_jar_calls(&self) -> usize {
        self.source_jar_calls.load(Ordering::SeqCst)
    }

    fn classpath_for(&self, root: &Path) -> Vec<PathBuf> {
        self.classpaths
            .lock()
            .get(root)
            .cloned()
            .unwrap_or_else(|| vec![root.join("build/classes")])
    }
}

impl Importer for MockImporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, project_root: &Path) -> bool {
        match self.handles_only.lock().as_ref() {
            Some(only) => project_root == only,
            None => true,
        }
    }

    fn resolve_classpath(&self, project_root: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let delay = *self.resolve_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.resolve_calls.lock().push(project_root.to_path_buf());
        Ok(self.classpath_for(project_root))
    }

    fn resolve_classpaths_for_root(
        &self,
        build_tool_root: &Path,
        subset: &[PathBuf],
    ) -> anyhow::Result<HashMap<PathBuf, Vec<PathBuf>>> {
        self.batch_calls
            .lock()
            .push((build_tool_root.to_path_buf(), subset.to_vec()));
        Ok(subset
            .iter()
            .map(|root| (root.clone(), self.classpath_for(root)))
            .collect())
    }

    fn supports_sibling_batching(&self) -> bool {
        self.batching_root.lock().is_some()
    }

    fn get_build_tool_root(&self, project_root: &Path) -> PathBuf {
        self.batching_root
            .lock()
            .clone()
            .unwrap_or_else(|| project_root.to_path_buf())
    }

    fn should_mark_classpath_resolved(&self, _project_root: &Path, _classpath: &[PathBuf]) -> bool {
        *self.mark_resolved.lock()
    }

    fn detect_project_language_version(
        &self,
        _project_root: &Path,
        _classpath: &[PathBuf],
    ) -> Option<String> {
        self.language_version.lock().clone()
    }

    fn recompile(&self, project_root: &Path) -> anyhow::Result<()> {
        self.recompile_calls.lock().push(project_root.to_path_buf());
        Ok(())
    }

    fn download_source_jars_async(&self, _project_root: &Path) {
        self.source_jar_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Fixture workspace
// ---------------------------------------------------------------------------

/// A temp-dir workspace with helpers for laying out mock projects.
pub struct TestWorkspace {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonicalize tempdir");
        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project(&self, name: &str) -> PathBuf {
        let root = self.root.join(name);
        std::fs::create_dir_all(&root).expect("create project dir");
        std::fs::write(root.join("build.gradle"), "// gradle build\n").expect("write build file");
        root
    }

    pub fn write_source(&self, project: &Path, relative: &str, text: &str) -> Url {
        let path = project.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create source dir");
        }
        std::fs::write(&path, text).expect("write source");
        Url::from_file_path(&path).expect("source uri")
    }

    pub fn uri_of(&self, project: &Path, relative: &str) -> Url {
        Url::from_file_path(project.join(relative)).expect("uri")
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
