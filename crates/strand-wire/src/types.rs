use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a node in the cluster roster. The only part of a node's
/// identity used for routing.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeIndex(pub u32);

impl From<u32> for NodeIndex {
    #[inline]
    fn from(idx: u32) -> Self {
        Self(idx)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Full node identity. `generation` bumps when a node is replaced at the
/// same index; it is checked at handshake and send admission to catch
/// stale addressing, never used for routing.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId {
    pub index: NodeIndex,
    pub generation: u32,
}

impl NodeId {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index: NodeIndex(index), generation }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}:G{}", self.index.0, self.generation)
    }
}

/// Identifier handed out to an accepted inbound socket by the server-side
/// sender. Opaque outside the owning worker.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// The one peer a connection talks to for its whole life.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PeerAddr {
    Server(NodeId),
    Client(ClientId),
}

impl PeerAddr {
    #[inline]
    pub fn class(&self) -> PeerClass {
        match self {
            Self::Server(_) => PeerClass::Server,
            Self::Client(_) => PeerClass::Client,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(node) => write!(f, "{node}"),
            Self::Client(client) => write!(f, "{client}"),
        }
    }
}

/// Budget partition a peer belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PeerClass {
    Server,
    Client,
}
