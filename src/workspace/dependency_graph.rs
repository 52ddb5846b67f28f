//! Per-scope source dependency graph.
//!
//! A directed graph of source URIs: `forward[u]` holds the URIs that `u`
//! imports, `reverse[u]` the URIs that import `u`. The reverse side answers
//! "what must be recompiled when `u` changes"; the depth-bounded forward
//! closure builds the file set for an incremental compile.
//!
//! Writes happen under the owning scope's write lock, so the graph itself
//! only needs a readers-writer lock to keep both adjacency sides consistent
//! for concurrent readers. [`DependencyGraph::update_dependencies`] rewrites
//! both sides for a URI in one critical section.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use tower_lsp::lsp_types::Url;

#[derive(Debug, Default)]
struct Adjacency {
    forward: FxHashMap<Url, FxHashSet<Url>>,
    reverse: FxHashMap<Url, FxHashSet<Url>>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: RwLock<Adjacency>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `u`'s outgoing edges with `deps`, updating the reverse side
    /// of every added and removed edge in the same critical section.
    pub fn update_dependencies(&self, u: &Url, deps: FxHashSet<Url>) {
        let mut edges = self.edges.write();

        if let Some(old) = edges.forward.get(u).cloned() {
            for removed in old.difference(&deps) {
                if let Some(dependents) = edges.reverse.get_mut(removed) {
                    dependents.remove(u);
                    if dependents.is_empty() {
                        edges.reverse.remove(removed);
                    }
                }
            }
        }

        for dep in &deps {
            edges
                .reverse
                .entry(dep.clone())
                .or_default()
                .insert(u.clone());
        }

        if deps.is_empty() {
            edges.forward.remove(u);
        } else {
            edges.forward.insert(u.clone(), deps);
        }
    }

    /// Removes `u` and every edge touching it.
    pub fn remove(&self, u: &Url) {
        let mut edges = self.edges.write();

        if let Some(deps) = edges.forward.remove(u) {
            for dep in deps {
                if let Some(dependents) = edges.reverse.get_mut(&dep) {
                    dependents.remove(u);
                    if dependents.is_empty() {
                        edges.reverse.remove(&dep);
                    }
                }
            }
        }
        if let Some(dependents) = edges.reverse.remove(u) {
            for dependent in dependents {
                if let Some(deps) = edges.forward.get_mut(&dependent) {
                    deps.remove(u);
                    if deps.is_empty() {
                        edges.forward.remove(&dependent);
                    }
                }
            }
        }
    }

    pub fn dependencies_of(&self, u: &Url) -> FxHashSet<Url> {
        self.edges.read().forward.get(u).cloned().unwrap_or_default()
    }

    pub fn dependents_of(&self, u: &Url) -> FxHashSet<Url> {
        self.edges.read().reverse.get(u).cloned().unwrap_or_default()
    }

    /// All URIs that transitively import any seed. Seeds themselves are not
    /// included unless reachable through a cycle from another seed.
    pub fn transitive_dependents<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a Url>,
    ) -> FxHashSet<Url> {
        let edges = self.edges.read();
        Self::bfs(&edges.reverse, seeds, usize::MAX)
    }

    /// URIs reachable from the seeds over import edges, bounded by `depth`
    /// hops. Depth 1 is direct imports only.
    pub fn transitive_dependencies<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a Url>,
        depth: usize,
    ) -> FxHashSet<Url> {
        let edges = self.edges.read();
        Self::bfs(&edges.forward, seeds, depth)
    }

    fn bfs<'a>(
        adjacency: &FxHashMap<Url, FxHashSet<Url>>,
        seeds: impl IntoIterator<Item = &'a Url>,
        depth: usize,
    ) -> FxHashSet<Url> {
        let mut visited = FxHashSet::default();
        let mut queue: VecDeque<(Url, usize)> = VecDeque::new();
        for seed in seeds {
            if visited.insert(seed.clone()) {
                queue.push_back((seed.clone(), 0));
            }
        }
        let seeds: FxHashSet<Url> = visited.clone();

        let mut result = FxHashSet::default();
        while let Some((current, hops)) = queue.pop_front() {
            if hops == depth {
                continue;
            }
            if let Some(next) = adjacency.get(&current) {
                for neighbor in next {
                    if visited.insert(neighbor.clone()) {
                        result.insert(neighbor.clone());
                        queue.push_back((neighbor.clone(), hops + 1));
                    } else if seeds.contains(neighbor) && !result.contains(neighbor) {
                        // A seed reachable from another seed participates in
                        // a cycle; report it so it gets recompiled.
                        result.insert(neighbor.clone());
                    }
                }
            }
        }
        result
    }

    pub fn clear(&self) {
        let mut edges = self.edges.write();
        edges.forward.clear();
        edges.reverse.clear();
    }

    pub fn is_empty(&self) -> bool {
        let edges = self.edges.read();
        edges.forward.is_empty() && edges.reverse.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.read().forward.values().map(FxHashSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///p/src/{name}.groovy")).unwrap()
    }

    fn deps(names: &[&str]) -> FxHashSet<Url> {
        names.iter().map(|n| uri(n)).collect()
    }

    #[test]
    fn update_installs_both_sides() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("Main"), deps(&["Util", "Model"]));

        assert_eq!(graph.dependencies_of(&uri("Main")), deps(&["Util", "Model"]));
        assert_eq!(graph.dependents_of(&uri("Util")), deps(&["Main"]));
        assert_eq!(graph.dependents_of(&uri("Model")), deps(&["Main"]));
    }

    #[test]
    fn update_replaces_previous_edges() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("Main"), deps(&["Util", "Model"]));
        graph.update_dependencies(&uri("Main"), deps(&["Model", "Service"]));

        assert_eq!(
            graph.dependencies_of(&uri("Main")),
            deps(&["Model", "Service"])
        );
        assert!(graph.dependents_of(&uri("Util")).is_empty());
        assert_eq!(graph.dependents_of(&uri("Service")), deps(&["Main"]));
    }

    #[test]
    fn remove_clears_both_directions() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("Main"), deps(&["Util"]));
        graph.update_dependencies(&uri("Util"), deps(&["Base"]));

        graph.remove(&uri("Util"));

        assert!(graph.dependencies_of(&uri("Util")).is_empty());
        assert!(graph.dependencies_of(&uri("Main")).is_empty());
        assert!(graph.dependents_of(&uri("Base")).is_empty());
    }

    #[test]
    fn transitive_dependents_walks_reverse_edges() {
        let graph = DependencyGraph::new();
        // Layers → Service → Base: editing Base recompiles both dependents.
        graph.update_dependencies(&uri("Layers"), deps(&["Service"]));
        graph.update_dependencies(&uri("Service"), deps(&["Base"]));

        let dependents = graph.transitive_dependents([&uri("Base")]);
        assert_eq!(dependents, deps(&["Service", "Layers"]));
    }

    #[test]
    fn transitive_dependencies_respects_depth() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("A"), deps(&["B"]));
        graph.update_dependencies(&uri("B"), deps(&["C"]));
        graph.update_dependencies(&uri("C"), deps(&["D"]));

        assert_eq!(graph.transitive_dependencies([&uri("A")], 1), deps(&["B"]));
        assert_eq!(
            graph.transitive_dependencies([&uri("A")], 2),
            deps(&["B", "C"])
        );
        assert_eq!(
            graph.transitive_dependencies([&uri("A")], usize::MAX),
            deps(&["B", "C", "D"])
        );
    }

    #[test]
    fn multi_seed_closure_unions() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("A"), deps(&["Shared"]));
        graph.update_dependencies(&uri("B"), deps(&["Other"]));

        let closure = graph.transitive_dependencies([&uri("A"), &uri("B")], 2);
        assert_eq!(closure, deps(&["Shared", "Other"]));
    }

    #[test]
    fn cycles_terminate() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("A"), deps(&["B"]));
        graph.update_dependencies(&uri("B"), deps(&["C"]));
        graph.update_dependencies(&uri("C"), deps(&["A"]));

        let dependents = graph.transitive_dependents([&uri("A")]);
        assert_eq!(dependents, deps(&["B", "C"]));

        let dependencies = graph.transitive_dependencies([&uri("A")], usize::MAX);
        assert!(dependencies.contains(&uri("B")));
        assert!(dependencies.contains(&uri("C")));
    }

    #[test]
    fn clear_empties_graph() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("A"), deps(&["B"]));
        assert!(!graph.is_empty());
        graph.clear();
        assert!(graph.is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn empty_update_removes_entry() {
        let graph = DependencyGraph::new();
        graph.update_dependencies(&uri("A"), deps(&["B"]));
        graph.update_dependencies(&uri("A"), FxHashSet::default());
        assert!(graph.is_empty());
    }
}
