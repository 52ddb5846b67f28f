pub mod classpath_cache;
pub mod coordinator;
pub mod importer;

pub use classpath_cache::{CachedClasspath, ClasspathCache};
pub use coordinator::ResolutionCoordinator;
pub use importer::{Importer, ImporterRegistry};
