pub mod dependency_graph;
pub mod file_contents;
pub mod scope;
pub mod scope_manager;

pub use dependency_graph::DependencyGraph;
pub use file_contents::FileContentsTracker;
pub use scope::{ProjectScope, ResolutionState, ScopeState};
pub use scope_manager::ScopeManager;
