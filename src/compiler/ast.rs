//! The AST index: per-file node data published after every compile visit.
//!
//! The index is replaced, never mutated in place; readers snapshot the
//! current `Arc` and work against an internally consistent view. Class
//! signatures are value-equal records of a class's externally observable
//! surface, used by the incremental compiler to decide whether an edit
//! changed a public API (and therefore whether dependents must be rebuilt).

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};
use tower_lsp::lsp_types::{Position, Range, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Visibility {
    Public,
    Protected,
    PackagePrivate,
    Private,
}

impl Visibility {
    fn observable(self) -> bool {
        self != Visibility::Private
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldSignature {
    pub name: String,
    pub type_name: String,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodSignature {
    pub name: String,
    pub return_type: String,
    pub parameter_types: Vec<String>,
    pub visibility: Visibility,
}

/// A class's externally observable surface. Two signatures compare equal iff
/// their public surfaces coincide: private members are ignored.
#[derive(Debug, Clone, Eq)]
pub struct ClassSignature {
    pub name: String,
    pub visibility: Visibility,
    pub supertypes: BTreeSet<String>,
    pub fields: BTreeSet<FieldSignature>,
    pub methods: BTreeSet<MethodSignature>,
}

impl ClassSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::Public,
            supertypes: BTreeSet::new(),
            fields: BTreeSet::new(),
            methods: BTreeSet::new(),
        }
    }

    fn observable_fields(&self) -> impl Iterator<Item = &FieldSignature> {
        self.fields.iter().filter(|f| f.visibility.observable())
    }

    fn observable_methods(&self) -> impl Iterator<Item = &MethodSignature> {
        self.methods.iter().filter(|m| m.visibility.observable())
    }
}

impl PartialEq for ClassSignature {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.visibility == other.visibility
            && self.supertypes == other.supertypes
            && self.observable_fields().eq(other.observable_fields())
            && self.observable_methods().eq(other.observable_methods())
    }
}

/// Node data for one source file, produced by the compiler's visit step.
#[derive(Debug, Clone, Default)]
pub struct FileAst {
    /// Total AST nodes visited in the file. Drives the last-known-good
    /// retention heuristic under transient syntax errors.
    pub node_count: usize,
    /// Classes declared in the file, with their signatures.
    pub classes: Vec<ClassSignature>,
    /// Source URIs this file references (imports, symbol uses). Feeds the
    /// scope's dependency graph.
    pub references: FxHashSet<Url>,
    /// Ranges covered by AST nodes; a cursor outside every range has no node
    /// under it and triggers placeholder injection.
    pub covered_ranges: Vec<Range>,
}

impl FileAst {
    pub fn covers(&self, position: Position) -> bool {
        self.covered_ranges
            .iter()
            .any(|range| range.start <= position && position <= range.end)
    }
}

/// Maps source URIs to compiled node data for one scope.
#[derive(Debug, Clone, Default)]
pub struct AstIndex {
    files: FxHashMap<Url, FileAst>,
}

impl AstIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: Url, file: FileAst) {
        self.files.insert(uri, file);
    }

    pub fn remove(&mut self, uri: &Url) -> Option<FileAst> {
        self.files.remove(uri)
    }

    pub fn file(&self, uri: &Url) -> Option<&FileAst> {
        self.files.get(uri)
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.files.contains_key(uri)
    }

    pub fn uris(&self) -> impl Iterator<Item = &Url> {
        self.files.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Url, &FileAst)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True when some AST node covers `position` in `uri`.
    pub fn node_at(&self, uri: &Url, position: Position) -> bool {
        self.file(uri).is_some_and(|file| file.covers(position))
    }

    /// Signatures of the classes declared in `uri`, sorted by class name for
    /// order-independent comparison.
    pub fn signatures_of(&self, uri: &Url) -> Vec<ClassSignature> {
        let mut signatures = self
            .file(uri)
            .map(|file| file.classes.clone())
            .unwrap_or_default();
        signatures.sort_by(|a, b| a.name.cmp(&b.name));
        signatures
    }

    /// Builds a successor index: this index's files overlaid with `updates`.
    /// Used by the incremental compile to splice re-visited files into the
    /// published snapshot.
    pub fn with_updates(&self, updates: AstIndex) -> AstIndex {
        let mut merged = self.clone();
        for (uri, file) in updates.files {
            merged.files.insert(uri, file);
        }
        merged
    }
}

impl FromIterator<(Url, FileAst)> for AstIndex {
    fn from_iter<I: IntoIterator<Item = (Url, FileAst)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    fn method(name: &str, visibility: Visibility) -> MethodSignature {
        MethodSignature {
            name: name.to_string(),
            return_type: "void".to_string(),
            parameter_types: vec![],
            visibility,
        }
    }

    #[test]
    fn signatures_ignore_private_members() {
        let mut a = ClassSignature::new("com.example.Service");
        a.methods.insert(method("run", Visibility::Public));
        a.methods.insert(method("helper", Visibility::Private));

        let mut b = ClassSignature::new("com.example.Service");
        b.methods.insert(method("run", Visibility::Public));
        b.methods.insert(method("otherHelper", Visibility::Private));

        assert_eq!(a, b);
    }

    #[test]
    fn public_method_change_breaks_equality() {
        let mut a = ClassSignature::new("com.example.Service");
        a.methods.insert(method("run", Visibility::Public));

        let mut b = ClassSignature::new("com.example.Service");
        b.methods.insert(MethodSignature {
            name: "run".to_string(),
            return_type: "void".to_string(),
            parameter_types: vec!["java.lang.String".to_string()],
            visibility: Visibility::Public,
        });

        assert_ne!(a, b);
    }

    #[test]
    fn supertype_change_breaks_equality() {
        let mut a = ClassSignature::new("com.example.Service");
        a.supertypes.insert("java.lang.Object".to_string());

        let mut b = ClassSignature::new("com.example.Service");
        b.supertypes.insert("com.example.Base".to_string());

        assert_ne!(a, b);
    }

    #[test]
    fn node_at_checks_covered_ranges() {
        let mut index = AstIndex::new();
        index.insert(
            uri("/p/src/A.groovy"),
            FileAst {
                node_count: 10,
                covered_ranges: vec![Range {
                    start: Position::new(0, 0),
                    end: Position::new(4, 0),
                }],
                ..Default::default()
            },
        );

        assert!(index.node_at(&uri("/p/src/A.groovy"), Position::new(2, 5)));
        assert!(!index.node_at(&uri("/p/src/A.groovy"), Position::new(9, 0)));
        assert!(!index.node_at(&uri("/p/src/B.groovy"), Position::new(0, 0)));
    }

    #[test]
    fn with_updates_overlays_files() {
        let a = uri("/p/A.groovy");
        let b = uri("/p/B.groovy");

        let mut base = AstIndex::new();
        base.insert(a.clone(), FileAst { node_count: 1, ..Default::default() });
        base.insert(b.clone(), FileAst { node_count: 2, ..Default::default() });

        let mut updates = AstIndex::new();
        updates.insert(a.clone(), FileAst { node_count: 7, ..Default::default() });

        let merged = base.with_updates(updates);
        assert_eq!(merged.file(&a).unwrap().node_count, 7);
        assert_eq!(merged.file(&b).unwrap().node_count, 2);
        // The base index is untouched.
        assert_eq!(base.file(&a).unwrap().node_count, 1);
    }

    #[test]
    fn signatures_of_sorts_by_name() {
        let u = uri("/p/A.groovy");
        let mut index = AstIndex::new();
        index.insert(
            u.clone(),
            FileAst {
                classes: vec![ClassSignature::new("b.Z"), ClassSignature::new("a.A")],
                ..Default::default()
            },
        );
        let signatures = index.signatures_of(&u);
        assert_eq!(signatures[0].name, "a.A");
        assert_eq!(signatures[1].name, "b.Z");
    }
}
