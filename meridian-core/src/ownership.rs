//! Data ownership — token ring, replication parameters and placements.
//!
//! A [`Placement`] assigns every token range of the ring to the nodes that
//! replicate it. Placements are derived, never stored authoritatively: they
//! are a pure function of `(Directory, ReplicationParams)`, so two snapshots
//! with the same directory and parameters always carry identical placements.
//! The commit path relies on this when it validates that a topology change
//! does not silently relocate data.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;

use crate::membership::{Directory, NodeId};

/// Fixed hash keys so ring positions are stable across nodes and restarts.
const RING_KEY_0: u64 = 0x4d45_5249_4449_414e;
const RING_KEY_1: u64 = 0x746f_6b65_6e72_696e;

/// Ring position of a node. Pure function of the node id — relocating a node
/// never moves it on the ring.
pub fn ring_token(node: NodeId) -> u64 {
    let mut h = SipHasher24::new_with_keys(RING_KEY_0, RING_KEY_1);
    h.write_u32(node.id());
    h.finish()
}

/// Half-open slice `(start, end]` of the u64 token ring.
///
/// `start == end` denotes the full ring (a single-node cluster owns
/// everything). Ranges where `start > end` wrap around the zero point.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct TokenRange {
    pub start: u64,
    pub end: u64,
}

impl TokenRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The range covering the whole ring.
    pub fn full_ring() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn contains(&self, token: u64) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            token > self.start && token <= self.end
        } else {
            token > self.start || token <= self.end
        }
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}

/// Replication parameters of a keyspace.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ReplicationParams {
    /// Rack- and datacenter-oblivious: the first `replication_factor`
    /// distinct nodes walking the ring.
    Simple { replication_factor: u32 },

    /// Datacenter- and rack-aware: per-datacenter replica counts, replicas
    /// spread across distinct racks where possible.
    NetworkTopology { replicas: BTreeMap<String, u32> },
}

impl ReplicationParams {
    pub fn simple(replication_factor: u32) -> Self {
        ReplicationParams::Simple { replication_factor }
    }

    pub fn network_topology<I, S>(replicas: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        ReplicationParams::NetworkTopology {
            replicas: replicas.into_iter().map(|(dc, rf)| (dc.into(), rf)).collect(),
        }
    }

    /// Whether these parameters reference `datacenter` by name. Simple
    /// replication references no datacenter at all.
    pub fn references_datacenter(&self, datacenter: &str) -> bool {
        match self {
            ReplicationParams::Simple { .. } => false,
            ReplicationParams::NetworkTopology { replicas } => {
                replicas.contains_key(datacenter)
            }
        }
    }

    pub fn total_replicas(&self) -> u32 {
        match self {
            ReplicationParams::Simple { replication_factor } => *replication_factor,
            ReplicationParams::NetworkTopology { replicas } => replicas.values().sum(),
        }
    }
}

impl fmt::Display for ReplicationParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationParams::Simple { replication_factor } => {
                write!(f, "simple(rf={})", replication_factor)
            }
            ReplicationParams::NetworkTopology { replicas } => {
                write!(f, "network_topology(")?;
                for (i, (dc, rf)) in replicas.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", dc, rf)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Replica groups of a single keyspace: which nodes own each token range.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Placement {
    replicas: BTreeMap<TokenRange, Vec<NodeId>>,
}

impl Placement {
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn ranges(&self) -> impl Iterator<Item = &TokenRange> {
        self.replicas.keys()
    }

    pub fn replicas_for_range(&self, range: &TokenRange) -> Option<&[NodeId]> {
        self.replicas.get(range).map(|r| r.as_slice())
    }

    /// Replicas of the range owning `token`.
    pub fn replicas_for_token(&self, token: u64) -> &[NodeId] {
        self.replicas
            .iter()
            .find(|(range, _)| range.contains(token))
            .map(|(_, nodes)| nodes.as_slice())
            .unwrap_or(&[])
    }
}

/// Placements of every keyspace, keyed by keyspace name.
pub type DataPlacements = BTreeMap<String, Placement>;

/// Pure, deterministic derivation of a [`Placement`] from a directory and
/// replication parameters.
///
/// Implementations hold no mutable state and are safe to call concurrently.
/// The commit path uses the provider only as a validation oracle; it never
/// mutates metadata through it.
pub trait PlacementProvider: Send + Sync {
    fn compute(&self, directory: &Directory, params: &ReplicationParams) -> Placement;
}

/// Reference provider: one token per node, ranges between consecutive ring
/// positions, replicas chosen by walking the ring clockwise from the owning
/// position.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenRingPlacement;

impl TokenRingPlacement {
    /// Ring members sorted by token. Node ids tie-break equal tokens so the
    /// order is total.
    fn ring(directory: &Directory) -> Vec<(u64, NodeId)> {
        let mut ring: Vec<(u64, NodeId)> = directory
            .peer_ids()
            .map(|id| (ring_token(id), id))
            .collect();
        ring.sort_unstable();
        ring
    }

    fn simple_replicas(ring: &[(u64, NodeId)], owner: usize, rf: usize) -> Vec<NodeId> {
        let take = rf.min(ring.len());
        (0..take)
            .map(|step| ring[(owner + step) % ring.len()].1)
            .collect()
    }

    /// Datacenter- and rack-aware selection. Walking the ring from the owning
    /// position, a node is accepted for its datacenter while the datacenter
    /// still needs replicas and its rack is not yet represented there; nodes
    /// on already-represented racks are deferred and only drafted once every
    /// rack of that datacenter holds a replica.
    fn topology_replicas(
        ring: &[(u64, NodeId)],
        directory: &Directory,
        owner: usize,
        replicas: &BTreeMap<String, u32>,
    ) -> Vec<NodeId> {
        let mut chosen: Vec<NodeId> = Vec::new();
        let mut remaining: BTreeMap<&str, u32> = replicas
            .iter()
            .filter(|(_, rf)| **rf > 0)
            .map(|(dc, rf)| (dc.as_str(), *rf))
            .collect();
        let mut racks_used: Vec<(&str, &str)> = Vec::new();
        let mut deferred: Vec<NodeId> = Vec::new();

        for step in 0..ring.len() {
            if remaining.values().all(|r| *r == 0) {
                break;
            }
            let node = ring[(owner + step) % ring.len()].1;
            let location = match directory.location(node) {
                Some(l) => l,
                None => continue,
            };
            let dc = location.datacenter.as_str();
            let quota = match remaining.get_mut(dc) {
                Some(q) if *q > 0 => q,
                _ => continue,
            };
            if racks_used.contains(&(dc, location.rack.as_str())) {
                deferred.push(node);
                continue;
            }
            racks_used.push((dc, location.rack.as_str()));
            *quota -= 1;
            chosen.push(node);
        }

        // Rack diversity exhausted; fill leftover quota in walk order.
        for node in deferred {
            let dc = match directory.location(node) {
                Some(l) => l.datacenter.as_str(),
                None => continue,
            };
            if let Some(quota) = remaining.get_mut(dc) {
                if *quota > 0 {
                    *quota -= 1;
                    chosen.push(node);
                }
            }
        }

        chosen
    }
}

impl PlacementProvider for TokenRingPlacement {
    fn compute(&self, directory: &Directory, params: &ReplicationParams) -> Placement {
        let ring = Self::ring(directory);
        if ring.is_empty() {
            return Placement::default();
        }

        let mut result = BTreeMap::new();
        for (idx, (token, _)) in ring.iter().enumerate() {
            let prev = ring[(idx + ring.len() - 1) % ring.len()].0;
            let range = if ring.len() == 1 {
                TokenRange::full_ring()
            } else {
                TokenRange::new(prev, *token)
            };

            let replicas = match params {
                ReplicationParams::Simple { replication_factor } => {
                    Self::simple_replicas(&ring, idx, *replication_factor as usize)
                }
                ReplicationParams::NetworkTopology { replicas } => {
                    Self::topology_replicas(&ring, directory, idx, replicas)
                }
            };
            result.insert(range, replicas);
        }

        Placement { replicas: result }
    }
}
