//! Class-signature capture and comparison for incremental safety.
//!
//! An incremental compile is only sound if the edit did not change any
//! class's externally observable surface; otherwise dependents compiled
//! against the old surface hold stale resolution results and a full rebuild
//! is required. Signatures are captured from the AST index before the
//! compile and compared against the re-visited files afterwards.

use rustc_hash::FxHashMap;
use tower_lsp::lsp_types::Url;

use crate::compiler::{AstIndex, ClassSignature};

pub type SignatureMap = FxHashMap<Url, Vec<ClassSignature>>;

/// Captures the (name-sorted) class signatures of `uris` from `index`. URIs
/// absent from the index record an empty signature list, so a file gaining
/// its first class also reads as an API change.
pub fn capture<'a>(
    index: Option<&AstIndex>,
    uris: impl IntoIterator<Item = &'a Url>,
) -> SignatureMap {
    uris.into_iter()
        .map(|uri| {
            let signatures = index
                .map(|index| index.signatures_of(uri))
                .unwrap_or_default();
            (uri.clone(), signatures)
        })
        .collect()
}

/// True when every URI's signature list is unchanged between captures.
pub fn unchanged(old: &SignatureMap, new: &SignatureMap) -> bool {
    old.len() == new.len()
        && old.iter().all(|(uri, old_signatures)| {
            new.get(uri)
                .is_some_and(|new_signatures| new_signatures == old_signatures)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{FileAst, MethodSignature, Visibility};

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///p/{name}.groovy")).unwrap()
    }

    fn index_with(name: &str, class: ClassSignature) -> AstIndex {
        let mut index = AstIndex::new();
        index.insert(
            uri(name),
            FileAst {
                classes: vec![class],
                ..Default::default()
            },
        );
        index
    }

    fn method(name: &str, parameters: &[&str]) -> MethodSignature {
        MethodSignature {
            name: name.to_string(),
            return_type: "void".to_string(),
            parameter_types: parameters.iter().map(|p| p.to_string()).collect(),
            visibility: Visibility::Public,
        }
    }

    #[test]
    fn identical_captures_compare_unchanged() {
        let mut class = ClassSignature::new("A");
        class.methods.insert(method("run", &[]));
        let before = capture(Some(&index_with("A", class.clone())), [&uri("A")]);
        let after = capture(Some(&index_with("A", class)), [&uri("A")]);
        assert!(unchanged(&before, &after));
    }

    #[test]
    fn parameter_change_is_detected() {
        let mut old_class = ClassSignature::new("A");
        old_class.methods.insert(method("run", &[]));
        let mut new_class = ClassSignature::new("A");
        new_class.methods.insert(method("run", &["java.lang.String"]));

        let before = capture(Some(&index_with("A", old_class)), [&uri("A")]);
        let after = capture(Some(&index_with("A", new_class)), [&uri("A")]);
        assert!(!unchanged(&before, &after));
    }

    #[test]
    fn file_gaining_a_class_is_a_change() {
        let before = capture(None, [&uri("A")]);
        let after = capture(Some(&index_with("A", ClassSignature::new("A"))), [&uri("A")]);
        assert!(!unchanged(&before, &after));
    }

    #[test]
    fn private_method_edit_is_not_a_change() {
        let mut old_class = ClassSignature::new("A");
        old_class.methods.insert(MethodSignature {
            name: "helper".to_string(),
            return_type: "void".to_string(),
            parameter_types: vec![],
            visibility: Visibility::Private,
        });
        let new_class = ClassSignature::new("A");

        let before = capture(Some(&index_with("A", old_class)), [&uri("A")]);
        let after = capture(Some(&index_with("A", new_class)), [&uri("A")]);
        assert!(unchanged(&before, &after));
    }
}
