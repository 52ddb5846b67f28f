//! Authoritative view of open-document text.
//!
//! The tracker owns three things:
//!
//! - live text for every open document, with incremental `didChange` edits
//!   applied in arrival order per URI,
//! - the accumulative set of changed URIs (only [`FileContentsTracker::reset_changed`]
//!   removes entries; a compile resets exactly the subset it consumed),
//! - a bounded read-through cache for closed files, so repeated disk reads
//!   during a compile burst hit memory.
//!
//! Reads never fail: an unreadable URI yields `None`.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use lru::LruCache;
use parking_lot::Mutex;
use tower_lsp::lsp_types::{Position, TextDocumentContentChangeEvent, Url};
use tracing::{debug, trace};

const CLOSED_CACHE_CAPACITY: usize = 64;

#[derive(Debug)]
struct OpenDocument {
    text: Arc<String>,
    version: i32,
}

pub struct FileContentsTracker {
    open: DashMap<Url, OpenDocument>,
    changed: DashSet<Url>,
    last_opened: Mutex<Option<Url>>,
    closed_cache: Mutex<LruCache<Url, Arc<String>>>,
}

impl FileContentsTracker {
    pub fn new() -> Self {
        Self {
            open: DashMap::new(),
            changed: DashSet::new(),
            last_opened: Mutex::new(None),
            closed_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CLOSED_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    pub fn did_open(&self, uri: Url, text: String, version: i32) {
        self.closed_cache.lock().pop(&uri);
        self.open.insert(
            uri.clone(),
            OpenDocument {
                text: Arc::new(text),
                version,
            },
        );
        self.changed.insert(uri.clone());
        *self.last_opened.lock() = Some(uri);
    }

    /// Applies incremental edits in arrival order. Unknown URIs are ignored
    /// (a change for a document the client never opened).
    pub fn did_change(&self, uri: &Url, version: i32, changes: &[TextDocumentContentChangeEvent]) {
        let Some(mut doc) = self.open.get_mut(uri) else {
            debug!("didChange for unopened document {}", uri);
            return;
        };
        let mut text = doc.text.as_ref().clone();
        for change in changes {
            match change.range {
                Some(range) => {
                    let start = offset_at(&text, range.start);
                    let end = offset_at(&text, range.end).max(start);
                    text.replace_range(start..end, &change.text);
                }
                None => text = change.text.clone(),
            }
        }
        doc.text = Arc::new(text);
        doc.version = version;
        drop(doc);
        self.changed.insert(uri.clone());
        trace!("applied {} edits to {} (v{})", changes.len(), uri, version);
    }

    pub fn did_close(&self, uri: &Url) {
        self.open.remove(uri);
        let mut last_opened = self.last_opened.lock();
        if last_opened.as_ref() == Some(uri) {
            *last_opened = None;
        }
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        self.open.contains_key(uri)
    }

    pub fn open_uris(&self) -> Vec<Url> {
        self.open.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn open_version(&self, uri: &Url) -> Option<i32> {
        self.open.get(uri).map(|doc| doc.version)
    }

    pub fn last_opened_uri(&self) -> Option<Url> {
        self.last_opened.lock().clone()
    }

    /// Open text, or disk content for closed files (cached), or `None`.
    pub fn get_contents(&self, uri: &Url) -> Option<Arc<String>> {
        if let Some(doc) = self.open.get(uri) {
            return Some(Arc::clone(&doc.text));
        }
        if let Some(cached) = self.closed_cache.lock().get(uri) {
            return Some(Arc::clone(cached));
        }
        let path = uri.to_file_path().ok()?;
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let text = Arc::new(text);
                self.closed_cache.lock().put(uri.clone(), Arc::clone(&text));
                Some(text)
            }
            Err(e) => {
                trace!("unreadable {}: {}", uri, e);
                None
            }
        }
    }

    /// Marks URIs dirty without an edit (placeholder restore, external
    /// rewrite).
    pub fn force_changed(&self, uris: impl IntoIterator<Item = Url>) {
        for uri in uris {
            self.changed.insert(uri);
        }
    }

    /// Removes exactly `subset` from the changed set; concurrent changes to
    /// other URIs survive.
    pub fn reset_changed<'a>(&self, subset: impl IntoIterator<Item = &'a Url>) {
        for uri in subset {
            self.changed.remove(uri);
        }
    }

    pub fn changed_uris(&self) -> Vec<Url> {
        self.changed.iter().map(|uri| uri.clone()).collect()
    }

    pub fn changed_uris_under(&self, root: &Path) -> Vec<Url> {
        self.changed
            .iter()
            .filter(|uri| is_under(uri, root))
            .map(|uri| uri.clone())
            .collect()
    }

    /// The hot query: does any pending change fall under `root`?
    pub fn has_changed_under(&self, root: &Path) -> bool {
        self.changed.iter().any(|uri| is_under(&uri, root))
    }

    pub fn has_open_under(&self, root: &Path) -> bool {
        self.open.iter().any(|entry| is_under(entry.key(), root))
    }

    pub fn invalidate_closed_cache<'a>(&self, uris: impl IntoIterator<Item = &'a Url>) {
        let mut cache = self.closed_cache.lock();
        for uri in uris {
            cache.pop(uri);
        }
    }
}

impl Default for FileContentsTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn is_under(uri: &Url, root: &Path) -> bool {
    uri.to_file_path()
        .map(|path| path.starts_with(root))
        .unwrap_or(false)
}

/// Byte offset of an LSP position. Characters count UTF-16 code units per the
/// protocol; positions past the end of a line or file clamp.
pub fn offset_at(text: &str, position: Position) -> usize {
    let mut line_start = 0;
    let mut line = 0;
    while line < position.line {
        match text[line_start..].find('\n') {
            Some(newline) => {
                line_start += newline + 1;
                line += 1;
            }
            None => return text.len(),
        }
    }

    let line_text = &text[line_start..];
    let line_end = line_text.find('\n').unwrap_or(line_text.len());
    let line_text = &line_text[..line_end];

    let mut utf16_remaining = position.character as usize;
    for (byte_index, ch) in line_text.char_indices() {
        if utf16_remaining == 0 {
            return line_start + byte_index;
        }
        let units = ch.len_utf16();
        if units > utf16_remaining {
            return line_start + byte_index;
        }
        utf16_remaining -= units;
    }
    line_start + line_end
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::Range;

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    fn edit(start: (u32, u32), end: (u32, u32), text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(Range {
                start: Position::new(start.0, start.1),
                end: Position::new(end.0, end.1),
            }),
            range_length: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn open_then_read_returns_live_text() {
        let tracker = FileContentsTracker::new();
        let u = uri("/p/src/A.groovy");
        tracker.did_open(u.clone(), "class A {}".to_string(), 1);

        assert!(tracker.is_open(&u));
        assert_eq!(tracker.get_contents(&u).unwrap().as_str(), "class A {}");
        assert_eq!(tracker.last_opened_uri(), Some(u));
    }

    #[test]
    fn incremental_edits_apply_in_order() {
        let tracker = FileContentsTracker::new();
        let u = uri("/p/src/A.groovy");
        tracker.did_open(u.clone(), "class A {\n}\n".to_string(), 1);

        tracker.did_change(&u, 2, &[edit((0, 6), (0, 7), "B")]);
        tracker.did_change(&u, 3, &[edit((1, 0), (1, 0), "  int x\n")]);

        assert_eq!(
            tracker.get_contents(&u).unwrap().as_str(),
            "class B {\n  int x\n}\n"
        );
    }

    #[test]
    fn full_replacement_edit() {
        let tracker = FileContentsTracker::new();
        let u = uri("/p/src/A.groovy");
        tracker.did_open(u.clone(), "old".to_string(), 1);
        tracker.did_change(
            &u,
            2,
            &[TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: "new".to_string(),
            }],
        );
        assert_eq!(tracker.get_contents(&u).unwrap().as_str(), "new");
    }

    #[test]
    fn utf16_positions_inside_multibyte_line() {
        let tracker = FileContentsTracker::new();
        let u = uri("/p/src/A.groovy");
        // '€' is one UTF-16 unit but three UTF-8 bytes.
        tracker.did_open(u.clone(), "x = '€'".to_string(), 1);
        tracker.did_change(&u, 2, &[edit((0, 5), (0, 6), "£")]);
        assert_eq!(tracker.get_contents(&u).unwrap().as_str(), "x = '£'");
    }

    #[test]
    fn changed_set_is_accumulative_and_reset_is_scoped() {
        let tracker = FileContentsTracker::new();
        let a = uri("/p/a/src/A.groovy");
        let b = uri("/p/b/src/B.groovy");
        tracker.did_open(a.clone(), String::new(), 1);
        tracker.did_open(b.clone(), String::new(), 1);

        assert!(tracker.has_changed_under(Path::new("/p/a")));
        assert!(tracker.has_changed_under(Path::new("/p/b")));

        let under_a = tracker.changed_uris_under(Path::new("/p/a"));
        tracker.reset_changed(under_a.iter());

        assert!(!tracker.has_changed_under(Path::new("/p/a")));
        assert!(tracker.has_changed_under(Path::new("/p/b")));
    }

    #[test]
    fn closing_does_not_clear_changed() {
        let tracker = FileContentsTracker::new();
        let u = uri("/p/src/A.groovy");
        tracker.did_open(u.clone(), String::new(), 1);
        tracker.did_close(&u);
        assert!(!tracker.is_open(&u));
        assert!(tracker.has_changed_under(Path::new("/p")));
    }

    #[test]
    fn closed_files_read_through_disk_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A.groovy");
        std::fs::write(&path, "class A {}").unwrap();
        let u = Url::from_file_path(&path).unwrap();

        let tracker = FileContentsTracker::new();
        assert_eq!(tracker.get_contents(&u).unwrap().as_str(), "class A {}");

        // A disk rewrite is invisible until the cache is invalidated.
        std::fs::write(&path, "class A { int x }").unwrap();
        assert_eq!(tracker.get_contents(&u).unwrap().as_str(), "class A {}");

        tracker.invalidate_closed_cache([&u]);
        assert_eq!(
            tracker.get_contents(&u).unwrap().as_str(),
            "class A { int x }"
        );
    }

    #[test]
    fn did_open_supersedes_closed_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A.groovy");
        std::fs::write(&path, "on disk").unwrap();
        let u = Url::from_file_path(&path).unwrap();

        let tracker = FileContentsTracker::new();
        tracker.get_contents(&u);
        tracker.did_open(u.clone(), "in editor".to_string(), 1);
        assert_eq!(tracker.get_contents(&u).unwrap().as_str(), "in editor");

        // After close, reads fall back to disk, not the stale cache entry.
        tracker.did_close(&u);
        assert_eq!(tracker.get_contents(&u).unwrap().as_str(), "on disk");
    }

    #[test]
    fn unreadable_uri_returns_none() {
        let tracker = FileContentsTracker::new();
        assert!(tracker.get_contents(&uri("/does/not/exist.groovy")).is_none());
    }
}
