//! Cluster membership — node identities, locations and the Directory.
//!
//! The [`Directory`] is the authoritative roster of cluster members. It is
//! only ever mutated by applying a committed transformation, and once part of
//! a [`ClusterMetadata`] snapshot it is immutable: updates produce a new
//! directory (copy-on-write), never modify one in place.
//!
//! [`ClusterMetadata`]: crate::metadata::ClusterMetadata

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Compact identifier for a cluster member.
///
/// Stable for the lifetime of membership — never reused while the node's
/// history still matters to placement.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Physical placement labels of a node: datacenter and rack.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Location {
    pub datacenter: String,
    pub rack: String,
}

impl Location {
    pub fn new(datacenter: impl Into<String>, rack: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            rack: rack.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.datacenter, self.rack)
    }
}

/// Network endpoint of a node, e.g. `"10.0.0.7:7433"`.
///
/// The CMS only records the endpoint; reachability and liveness are the
/// transport's concern.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NodeAddr(pub String);

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Roster entry for a single node.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
struct Peer {
    addr: NodeAddr,
    location: Location,
}

/// Authoritative mapping of node identities to endpoints and locations.
///
/// Every registered node has exactly one location at any epoch; the single
/// insertion path ([`Directory::with_peer`]) enforces this by construction.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Directory {
    peers: BTreeMap<NodeId, Peer>,
}

impl Directory {
    pub const EMPTY: Directory = Directory {
        peers: BTreeMap::new(),
    };

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.peers.contains_key(&node)
    }

    /// All member ids, in ascending order.
    pub fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.peers.keys().copied()
    }

    pub fn location(&self, node: NodeId) -> Option<&Location> {
        self.peers.get(&node).map(|p| &p.location)
    }

    pub fn endpoint(&self, node: NodeId) -> Option<&NodeAddr> {
        self.peers.get(&node).map(|p| &p.addr)
    }

    /// Datacenters currently hosting at least one node.
    pub fn datacenters(&self) -> impl Iterator<Item = &str> {
        let mut seen: Vec<&str> = self
            .peers
            .values()
            .map(|p| p.location.datacenter.as_str())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.into_iter()
    }

    /// New directory with `node` added (or its entry replaced).
    pub fn with_peer(&self, node: NodeId, addr: NodeAddr, location: Location) -> Directory {
        let mut peers = self.peers.clone();
        peers.insert(node, Peer { addr, location });
        Directory { peers }
    }

    /// New directory with `node`'s location replaced. Returns an unchanged
    /// clone if the node is not a member.
    pub fn with_location(&self, node: NodeId, location: Location) -> Directory {
        let mut peers = self.peers.clone();
        if let Some(peer) = peers.get_mut(&node) {
            peer.location = location;
        }
        Directory { peers }
    }

    /// New directory with `node` removed.
    pub fn without_peer(&self, node: NodeId) -> Directory {
        let mut peers = self.peers.clone();
        peers.remove(&node);
        Directory { peers }
    }
}
