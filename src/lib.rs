//! Core of a Language Server Protocol backend for Groovy.
//!
//! This crate implements the multi-project compilation orchestrator that sits
//! between an LSP transport and a Groovy compiler front-end:
//!
//! - workspace partitioning into per-project scopes with distinct classpaths,
//! - lazy classpath resolution through external build-tool importers,
//! - full, staged, and incremental compilation scheduling under memory and
//!   concurrency pressure,
//! - a per-scope source dependency graph driving incremental recompiles,
//! - file-change coordination with debouncing, coalescing, and cache
//!   invalidation,
//! - eviction of idle scopes to bound resident memory.
//!
//! The compiler front-end, build-tool invocations, and individual LSP feature
//! providers are consumed behind traits ([`compiler::Compiler`],
//! [`resolve::Importer`], [`lsp::FeatureProviders`]); the wire transport is
//! delegated to `tower-lsp`. A downstream binary links concrete
//! implementations and serves [`lsp::GroovyBackend`] over stdio or a socket.

pub mod compile;
pub mod compiler;
pub mod config;
pub mod exec;
pub mod logging;
pub mod lsp;
pub mod memory;
pub mod resolve;
#[cfg(feature = "test-util")]
pub mod testing;
pub mod watch;
pub mod workspace;
