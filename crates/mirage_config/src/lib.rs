pub mod cluster;
pub mod global;
pub mod mediator;
pub mod mirage;
pub mod sequence;
pub mod server;
pub mod store;
pub mod validation;

pub use cluster::ClusterConfig;
pub use global::GlobalConfig;
pub use mediator::{CacheScope, ImplementationConfig, ImplementationType, MediatorConfig, OnCacheHitConfig};
pub use mirage::MirageConfig;
pub use sequence::{SequenceConfig, StepConfig};
pub use server::ServerConfig;
pub use store::StoreConfig;
pub use validation::ConfigReport;
