pub mod backend;
pub mod protocol;
pub mod providers;

pub use backend::{CoreConfig, GroovyBackend, ServerCore, build_service};
pub use protocol::{ClientSink, MemoryUsageParams, StatusState, StatusUpdateParams, TowerLspSink};
pub use providers::{FeatureProviders, NoProviders};
