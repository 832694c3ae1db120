use std::{collections::BTreeMap, net::SocketAddr, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use strand_wire::NodeIndex;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config")]
    Parse(#[from] serde_json::Error),
    #[error("node index {0} listed twice")]
    DuplicateNode(NodeIndex),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEntry {
    pub index: NodeIndex,
    pub address: SocketAddr,
    pub generation: u32,
}

/// One immutable roster snapshot: the full node set of the cluster plus
/// its name. Swapped wholesale, never patched in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub version: u64,
    pub nodes: Vec<NodeEntry>,
    #[serde(skip)]
    by_index: BTreeMap<NodeIndex, usize>,
}

impl ClusterConfig {
    pub fn new(
        cluster_name: impl Into<String>,
        version: u64,
        nodes: Vec<NodeEntry>,
    ) -> Result<Self, ConfigError> {
        let mut cfg =
            Self { cluster_name: cluster_name.into(), version, nodes, by_index: BTreeMap::new() };
        cfg.reindex()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        let mut cfg: Self = serde_json::from_slice(&raw)?;
        cfg.reindex()?;
        Ok(cfg)
    }

    fn reindex(&mut self) -> Result<(), ConfigError> {
        self.by_index.clear();
        for (at, node) in self.nodes.iter().enumerate() {
            if self.by_index.insert(node.index, at).is_some() {
                return Err(ConfigError::DuplicateNode(node.index));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn lookup(&self, index: NodeIndex) -> Option<(SocketAddr, u32)> {
        let at = *self.by_index.get(&index)?;
        let node = &self.nodes[at];
        Some((node.address, node.generation))
    }

    #[inline]
    pub fn contains(&self, index: NodeIndex) -> bool {
        self.by_index.contains_key(&index)
    }
}

/// Shared, atomically swappable view of the current roster. Cheap to
/// clone; every clone observes the same snapshot pointer.
#[derive(Clone)]
pub struct ConfigView {
    current: Arc<ArcSwap<ClusterConfig>>,
}

impl ConfigView {
    pub fn new(config: ClusterConfig) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(config)) }
    }

    /// The snapshot as of this call. Holders keep the roster they loaded;
    /// later swaps do not tear an in-progress operation.
    #[inline]
    pub fn snapshot(&self) -> Arc<ClusterConfig> {
        self.current.load_full()
    }

    pub fn swap(&self, config: ClusterConfig) {
        info!(version = config.version, nodes = config.nodes.len(), "cluster config updated");
        self.current.store(Arc::new(config));
    }

    #[inline]
    pub fn lookup(&self, index: NodeIndex) -> Option<(SocketAddr, u32)> {
        self.current.load().lookup(index)
    }

    #[inline]
    pub fn cluster_name(&self) -> String {
        self.current.load().cluster_name.clone()
    }
}
