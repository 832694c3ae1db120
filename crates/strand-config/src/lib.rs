mod cluster;
mod store;

pub use cluster::{ClusterConfig, ConfigError, ConfigView, NodeEntry};
pub use store::{
    ExtractVersionFn, GetCallback, MutationFn, UpdateCallback, Version, VersionedConfigStore,
};
