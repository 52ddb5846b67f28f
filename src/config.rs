//! Server configuration: initialization options and workspace settings.
//!
//! Initialization options arrive once in `InitializeParams` and are fixed for
//! the lifetime of the server. Workspace settings arrive through
//! `didChangeConfiguration` and may change at any time; only the recognized
//! `groovy.*` paths are read, everything else is ignored.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Protocol version spoken by this server core. A client/server mismatch is
/// logged but non-fatal.
pub const PROTOCOL_VERSION: &str = "2";

/// Log level names accepted in initialization options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Options recognized in `InitializeParams::initialization_options`.
///
/// Unknown fields are ignored so newer clients can talk to older servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    /// Client's expected protocol version; mismatches are logged.
    pub protocol_version: Option<String>,
    pub log_level: Option<LogLevel>,
    /// Disables the on-disk classpath cache when false.
    pub classpath_cache: bool,
    /// Importer identifiers to enable; `None` enables all registered.
    pub enabled_importers: Option<Vec<String>>,
    pub backfill_sibling_projects: bool,
    #[serde(rename = "scopeEvictionTTLSeconds")]
    pub scope_eviction_ttl_seconds: u64,
    /// Fraction of max heap at which the sweeper evicts the LRU scope
    /// regardless of TTL. Must be in (0, 1].
    pub memory_pressure_threshold: f64,
    /// Package prefixes excluded from compilation.
    pub rejected_packages: Vec<String>,
    /// Node-count ratio below which an errored file keeps its previous AST
    /// data. A fresh visit yielding fewer than `previous / ratio` nodes is
    /// treated as a transient syntax break.
    pub ast_retention_ratio: f64,
    /// Heap ceiling reported by the memory gauge, in megabytes.
    #[serde(rename = "maxHeapMB")]
    pub max_heap_mb: Option<u64>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            protocol_version: None,
            log_level: None,
            classpath_cache: true,
            enabled_importers: None,
            backfill_sibling_projects: false,
            scope_eviction_ttl_seconds: 600,
            memory_pressure_threshold: 0.85,
            rejected_packages: Vec::new(),
            ast_retention_ratio: 2.0,
            max_heap_mb: None,
        }
    }
}

impl ServerOptions {
    /// Parses initialization options, falling back to defaults on absence or
    /// malformed input.
    pub fn from_initialization_options(options: Option<Value>) -> Self {
        let Some(value) = options else {
            return Self::default();
        };
        match serde_json::from_value::<Self>(value) {
            Ok(mut opts) => {
                if !(opts.memory_pressure_threshold > 0.0 && opts.memory_pressure_threshold <= 1.0)
                {
                    warn!(
                        "memoryPressureThreshold {} out of (0, 1], using default",
                        opts.memory_pressure_threshold
                    );
                    opts.memory_pressure_threshold = Self::default().memory_pressure_threshold;
                }
                if opts.ast_retention_ratio < 1.0 {
                    opts.ast_retention_ratio = Self::default().ast_retention_ratio;
                }
                if let Some(client_version) = &opts.protocol_version
                    && client_version != PROTOCOL_VERSION
                {
                    warn!(
                        "protocol version mismatch: client expects {}, server speaks {}",
                        client_version, PROTOCOL_VERSION
                    );
                }
                opts
            }
            Err(e) => {
                warn!("malformed initialization options ({}), using defaults", e);
                Self::default()
            }
        }
    }
}

/// Mutable workspace settings from `didChangeConfiguration`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceConfig {
    /// Extra classpath entries, applied to the default scope only.
    pub classpath: Vec<String>,
    pub semantic_highlighting_enabled: bool,
    pub formatting_enabled: bool,
    pub organize_imports: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            classpath: Vec::new(),
            semantic_highlighting_enabled: true,
            formatting_enabled: true,
            organize_imports: true,
        }
    }
}

impl WorkspaceConfig {
    /// Applies a `didChangeConfiguration` payload. Returns `true` if the
    /// classpath changed (the caller re-applies it to the default scope).
    pub fn apply_settings(&mut self, settings: &Value) -> bool {
        let groovy = settings.get("groovy").unwrap_or(settings);

        let old_classpath = std::mem::take(&mut self.classpath);
        if let Some(entries) = groovy.get("classpath").and_then(Value::as_array) {
            self.classpath = entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect();
        }

        if let Some(enabled) = groovy
            .pointer("/semanticHighlighting/enabled")
            .and_then(Value::as_bool)
        {
            self.semantic_highlighting_enabled = enabled;
        }
        if let Some(enabled) = groovy.pointer("/formatting/enabled").and_then(Value::as_bool) {
            self.formatting_enabled = enabled;
        }
        if let Some(organize) = groovy
            .pointer("/formatting/organizeImports")
            .and_then(Value::as_bool)
        {
            self.organize_imports = organize;
        }

        self.classpath != old_classpath
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_when_options_absent() {
        let opts = ServerOptions::from_initialization_options(None);
        assert!(opts.classpath_cache);
        assert!(!opts.backfill_sibling_projects);
        assert_eq!(opts.scope_eviction_ttl_seconds, 600);
    }

    #[test]
    fn parses_recognized_options() {
        let opts = ServerOptions::from_initialization_options(Some(json!({
            "logLevel": "DEBUG",
            "classpathCache": false,
            "enabledImporters": ["gradle"],
            "backfillSiblingProjects": true,
            "scopeEvictionTTLSeconds": 120,
            "memoryPressureThreshold": 0.5,
            "rejectedPackages": ["com.example.generated"],
        })));
        assert_eq!(opts.log_level, Some(LogLevel::Debug));
        assert!(!opts.classpath_cache);
        assert_eq!(opts.enabled_importers.as_deref(), Some(&["gradle".to_string()][..]));
        assert!(opts.backfill_sibling_projects);
        assert_eq!(opts.scope_eviction_ttl_seconds, 120);
        assert_eq!(opts.memory_pressure_threshold, 0.5);
        assert_eq!(opts.rejected_packages, vec!["com.example.generated"]);
    }

    #[test]
    fn malformed_options_fall_back_to_defaults() {
        let opts = ServerOptions::from_initialization_options(Some(json!("not an object")));
        assert!(opts.classpath_cache);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let opts = ServerOptions::from_initialization_options(Some(json!({
            "memoryPressureThreshold": 1.5,
        })));
        assert_eq!(opts.memory_pressure_threshold, 0.85);
    }

    #[test]
    fn workspace_config_reads_groovy_section() {
        let mut config = WorkspaceConfig::default();
        let changed = config.apply_settings(&json!({
            "groovy": {
                "classpath": ["/opt/libs/a.jar", "/opt/libs/b.jar"],
                "semanticHighlighting": { "enabled": false },
                "formatting": { "enabled": true, "organizeImports": false },
            }
        }));
        assert!(changed);
        assert_eq!(config.classpath.len(), 2);
        assert!(!config.semantic_highlighting_enabled);
        assert!(config.formatting_enabled);
        assert!(!config.organize_imports);
    }

    #[test]
    fn unchanged_classpath_reports_false() {
        let mut config = WorkspaceConfig::default();
        let changed = config.apply_settings(&json!({
            "groovy": { "formatting": { "enabled": false } }
        }));
        assert!(!changed);
        assert!(!config.formatting_enabled);
    }
}
