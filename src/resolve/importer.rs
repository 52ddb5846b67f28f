//! Build-tool importers.
//!
//! An importer knows how to ask one build tool (Gradle, Maven, …) for a
//! project's classpath. Importers are values behind a fixed capability
//! interface, chosen by name at registration time; the coordinator never
//! downcasts. All methods may block on external process I/O; callers run
//! them on the import pool via `spawn_blocking`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait Importer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// True when this importer recognizes the project's build descriptor.
    fn handles(&self, project_root: &Path) -> bool;

    /// Resolves the ordered classpath for one project. Blocking.
    fn resolve_classpath(&self, project_root: &Path) -> anyhow::Result<Vec<PathBuf>>;

    /// Batch resolution for sibling subprojects under one build-tool root.
    /// Only called when [`Importer::supports_sibling_batching`] is true.
    fn resolve_classpaths_for_root(
        &self,
        build_tool_root: &Path,
        subset: &[PathBuf],
    ) -> anyhow::Result<HashMap<PathBuf, Vec<PathBuf>>> {
        let _ = build_tool_root;
        let _ = subset;
        Ok(HashMap::new())
    }

    fn supports_sibling_batching(&self) -> bool {
        false
    }

    /// The umbrella root containing related subprojects (for Gradle, the
    /// directory holding `settings.gradle`). Defaults to the project root.
    fn get_build_tool_root(&self, project_root: &Path) -> PathBuf {
        project_root.to_path_buf()
    }

    /// An importer may deliver a degraded classpath (the project's own
    /// classes but no dependencies) and ask that the scope stay unresolved
    /// so the next trigger retries.
    fn should_mark_classpath_resolved(&self, project_root: &Path, classpath: &[PathBuf]) -> bool {
        let _ = project_root;
        !classpath.is_empty()
    }

    fn detect_project_language_version(
        &self,
        project_root: &Path,
        classpath: &[PathBuf],
    ) -> Option<String> {
        let _ = project_root;
        let _ = classpath;
        None
    }

    /// Compiles pre-dependency sources (annotation processors, generated
    /// code) with the build tool itself. Blocking; may fail.
    fn recompile(&self, project_root: &Path) -> anyhow::Result<()>;

    /// Kicks off a background source-jar download for navigation into
    /// dependencies. Fire-and-forget; never on the critical path.
    fn download_source_jars_async(&self, project_root: &Path) {
        let _ = project_root;
    }
}

/// Importers registered at startup, filtered by the `enabledImporters`
/// initialization option.
pub struct ImporterRegistry {
    importers: Vec<Arc<dyn Importer>>,
}

impl ImporterRegistry {
    pub fn new(importers: Vec<Arc<dyn Importer>>, enabled: Option<&[String]>) -> Self {
        let importers = match enabled {
            Some(enabled) => importers
                .into_iter()
                .filter(|importer| enabled.iter().any(|name| name == importer.name()))
                .collect(),
            None => importers,
        };
        Self { importers }
    }

    /// The first enabled importer that recognizes the project.
    pub fn importer_for(&self, project_root: &Path) -> Option<Arc<dyn Importer>> {
        self.importers
            .iter()
            .find(|importer| importer.handles(project_root))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.importers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.importers.iter().map(|i| i.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockImporter;

    #[test]
    fn registry_filters_by_enabled_names() {
        let gradle = Arc::new(MockImporter::new("gradle"));
        let maven = Arc::new(MockImporter::new("maven"));
        let registry = ImporterRegistry::new(
            vec![gradle, maven],
            Some(&["maven".to_string()]),
        );
        assert_eq!(registry.names(), vec!["maven"]);
    }

    #[test]
    fn importer_selected_by_handles() {
        let gradle = Arc::new(MockImporter::new("gradle").handling_only("/ws/gradle-app"));
        let maven = Arc::new(MockImporter::new("maven").handling_only("/ws/maven-app"));
        let registry = ImporterRegistry::new(vec![gradle, maven], None);

        let chosen = registry.importer_for(Path::new("/ws/maven-app")).unwrap();
        assert_eq!(chosen.name(), "maven");
        assert!(registry.importer_for(Path::new("/ws/other")).is_none());
    }
}
