//! Transformations — proposed, validated, atomically-applied metadata
//! mutations.
//!
//! Every structural change to the cluster flows through exactly one
//! [`Transformation`] committed to the metadata log. A variant carries its
//! proposed delta and knows how to validate itself against a snapshot and how
//! to produce the successor snapshot. `apply` is only ever invoked after
//! `validate` succeeded on the same snapshot; the commit path guarantees the
//! pairing.
//!
//! Custom (extension) transformations are registered by name and carry an
//! opaque JSON payload, so they replicate like any other entry without the
//! log knowing their semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Rejection;
use crate::membership::{Directory, Location, NodeAddr, NodeId};
use crate::metadata::ClusterMetadata;
use crate::ownership::{PlacementProvider, ReplicationParams};
use crate::sequences::{AffectedRanges, LockKey};

/// Rejection text for proposals that would silently relocate data.
pub const REJECTED_PLACEMENT_CHANGE: &str = "Proposed updates modify data placements";

/// Rejection text for placement-affecting proposals submitted while a range
/// movement holds locks.
pub const REJECTED_ONGOING_MOVEMENTS: &str =
    "topology changes cannot be executed while there are ongoing range movements";

/// Operator-supplied transformation logic, registered by name.
///
/// Extensions receive the opaque payload their proposer attached; they must be
/// registered under the same name on every node before entries referencing
/// them can replay.
pub trait CustomExtension: Send + Sync {
    fn validate(
        &self,
        payload: &serde_json::Value,
        metadata: &ClusterMetadata,
    ) -> Result<(), Rejection>;

    fn apply(&self, payload: &serde_json::Value, metadata: &ClusterMetadata) -> ClusterMetadata;
}

/// Name-keyed registry of [`CustomExtension`] handlers. Cheap to clone and
/// share; every node of a cluster registers the same set.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    inner: Arc<DashMap<String, Arc<dyn CustomExtension>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, extension: Arc<dyn CustomExtension>) {
        self.inner.insert(name.into(), extension);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomExtension>> {
        self.inner.get(name).map(|e| e.value().clone())
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ExtensionRegistry")
            .field("names", &names)
            .finish()
    }
}

/// Validation/apply context: the placement oracle and the extension registry.
#[derive(Clone, Copy)]
pub struct TransformEnv<'a> {
    pub provider: &'a dyn PlacementProvider,
    pub extensions: &'a ExtensionRegistry,
}

/// A proposed metadata mutation.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Transformation {
    /// Add a node to the directory (or re-assert an identical registration).
    RegisterNode {
        node: NodeId,
        addr: NodeAddr,
        location: Location,
    },

    /// Change one or more nodes' locations without relocating data.
    AlterTopology {
        updates: BTreeMap<NodeId, Location>,
    },

    /// Create a keyspace or replace its replication parameters.
    AlterReplication {
        keyspace: String,
        params: ReplicationParams,
    },

    /// Mark ranges as undergoing an ownership transition.
    LockRanges {
        key: LockKey,
        ranges: AffectedRanges,
    },

    /// Release a transition's locks. Unlocking an absent key succeeds as a
    /// no-op so cleanup can always be retried.
    UnlockRanges { key: LockKey },

    /// Registered-by-name extension transformation with an opaque payload.
    Custom {
        name: String,
        payload: serde_json::Value,
    },
}

/// Discriminant of a transformation, for logging and dispatch tables.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Kind {
    RegisterNode,
    AlterTopology,
    AlterReplication,
    LockRanges,
    UnlockRanges,
    Custom,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::RegisterNode => "register_node",
            Kind::AlterTopology => "alter_topology",
            Kind::AlterReplication => "alter_replication",
            Kind::LockRanges => "lock_ranges",
            Kind::UnlockRanges => "unlock_ranges",
            Kind::Custom => "custom",
        };
        f.write_str(name)
    }
}

impl Transformation {
    pub fn kind(&self) -> Kind {
        match self {
            Transformation::RegisterNode { .. } => Kind::RegisterNode,
            Transformation::AlterTopology { .. } => Kind::AlterTopology,
            Transformation::AlterReplication { .. } => Kind::AlterReplication,
            Transformation::LockRanges { .. } => Kind::LockRanges,
            Transformation::UnlockRanges { .. } => Kind::UnlockRanges,
            Transformation::Custom { .. } => Kind::Custom,
        }
    }

    /// Check the proposal against `metadata`. A returned [`Rejection`] means
    /// the proposal must have no effect whatsoever on the log.
    pub fn validate(
        &self,
        metadata: &ClusterMetadata,
        env: TransformEnv<'_>,
    ) -> Result<(), Rejection> {
        match self {
            Transformation::RegisterNode {
                node,
                addr,
                location,
            } => validate_register(metadata, *node, addr, location),

            Transformation::AlterTopology { updates } => {
                validate_alter_topology(metadata, updates, env.provider)
            }

            Transformation::AlterReplication { keyspace, params } => {
                validate_alter_replication(metadata, keyspace, params)
            }

            Transformation::LockRanges { .. } | Transformation::UnlockRanges { .. } => Ok(()),

            Transformation::Custom { name, payload } => match env.extensions.get(name) {
                Some(extension) => extension.validate(payload, metadata),
                None => Err(Rejection::invalid(format!(
                    "Unknown custom transformation: {}",
                    name
                ))),
            },
        }
    }

    /// Produce the successor snapshot. Must only be called after a successful
    /// [`validate`](Self::validate) against the same snapshot; the returned
    /// snapshot still carries the predecessor's epoch — the commit path
    /// assigns the next one.
    pub fn apply(&self, metadata: &ClusterMetadata, env: TransformEnv<'_>) -> ClusterMetadata {
        match self {
            Transformation::RegisterNode {
                node,
                addr,
                location,
            } => {
                let directory =
                    metadata
                        .directory
                        .with_peer(*node, addr.clone(), location.clone());
                metadata.with_directory(directory, env.provider)
            }

            Transformation::AlterTopology { updates } => {
                let mut directory = metadata.directory.clone();
                for (node, location) in updates {
                    directory = directory.with_location(*node, location.clone());
                }
                metadata.with_directory(directory, env.provider)
            }

            Transformation::AlterReplication { keyspace, params } => {
                metadata.with_replication(keyspace, params.clone(), env.provider)
            }

            Transformation::LockRanges { key, ranges } => {
                metadata.with_locked_ranges(metadata.locked_ranges.lock(*key, ranges.clone()))
            }

            Transformation::UnlockRanges { key } => {
                metadata.with_locked_ranges(metadata.locked_ranges.unlock(*key))
            }

            Transformation::Custom { name, payload } => {
                // validate() already resolved the extension; a miss here is a
                // replay divergence handled by the log layer.
                match env.extensions.get(name) {
                    Some(extension) => extension.apply(payload, metadata),
                    None => metadata.clone(),
                }
            }
        }
    }
}

fn validate_register(
    metadata: &ClusterMetadata,
    node: NodeId,
    addr: &NodeAddr,
    location: &Location,
) -> Result<(), Rejection> {
    if !metadata.locked_ranges.is_empty() {
        return Err(Rejection::invalid(REJECTED_ONGOING_MOVEMENTS));
    }
    if metadata.directory.contains(node) {
        let same = metadata.directory.location(node) == Some(location)
            && metadata.directory.endpoint(node) == Some(addr);
        if !same {
            return Err(Rejection::invalid(format!(
                "{} is already registered with a different location or endpoint",
                node
            )));
        }
        // identical re-registration commits as a no-op
    }
    Ok(())
}

fn validate_alter_topology(
    metadata: &ClusterMetadata,
    updates: &BTreeMap<NodeId, Location>,
    provider: &dyn PlacementProvider,
) -> Result<(), Rejection> {
    if !metadata.locked_ranges.is_empty() {
        return Err(Rejection::invalid(REJECTED_ONGOING_MOVEMENTS));
    }

    let unknown: Vec<NodeId> = updates
        .keys()
        .copied()
        .filter(|n| !metadata.directory.contains(*n))
        .collect();
    if !unknown.is_empty() {
        return Err(Rejection::invalid(format!(
            "Proposed updates reference nodes not present in the directory: {:?}",
            unknown
        )));
    }

    // Datacenter names touched by the proposal, on either side of the move.
    let mut touched: BTreeSet<&str> = BTreeSet::new();
    for (node, new_location) in updates {
        if let Some(old) = metadata.directory.location(*node) {
            touched.insert(old.datacenter.as_str());
        }
        touched.insert(new_location.datacenter.as_str());
    }

    let mut proposed = metadata.directory.clone();
    for (node, location) in updates {
        proposed = proposed.with_location(*node, location.clone());
    }

    // Placement equivalence, keyspace by keyspace, but only for keyspaces
    // whose replication actually references a touched datacenter. Simple
    // replication is location-independent, which is what makes the two-step
    // datacenter rename (re-point replication, then rename) possible.
    for (keyspace, params) in &metadata.keyspaces {
        if !touched.iter().any(|dc| params.references_datacenter(dc)) {
            continue;
        }
        let before = provider.compute(&metadata.directory, params);
        let after = provider.compute(&proposed, params);
        if before != after {
            debug!(keyspace = %keyspace, "proposed topology update changes replica groups");
            return Err(Rejection::invalid(REJECTED_PLACEMENT_CHANGE));
        }
    }

    Ok(())
}

fn validate_alter_replication(
    metadata: &ClusterMetadata,
    keyspace: &str,
    params: &ReplicationParams,
) -> Result<(), Rejection> {
    if !metadata.locked_ranges.is_empty() {
        return Err(Rejection::invalid(REJECTED_ONGOING_MOVEMENTS));
    }
    if keyspace.is_empty() {
        return Err(Rejection::invalid("Keyspace name must not be empty"));
    }
    if params.total_replicas() == 0 {
        return Err(Rejection::invalid(
            "Replication parameters must specify at least one replica",
        ));
    }
    if let ReplicationParams::NetworkTopology { replicas } = params {
        let known: BTreeSet<&str> = metadata.directory.datacenters().collect();
        for dc in replicas.keys() {
            if !known.contains(dc.as_str()) {
                return Err(Rejection::invalid(format!(
                    "Replication parameters reference unknown datacenter: {}",
                    dc
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;
    use crate::ownership::TokenRingPlacement;

    fn env<'a>(extensions: &'a ExtensionRegistry) -> TransformEnv<'a> {
        TransformEnv {
            provider: &TokenRingPlacement,
            extensions,
        }
    }

    fn bootstrap() -> (ClusterMetadata, ExtensionRegistry) {
        let extensions = ExtensionRegistry::new();
        let mut metadata = ClusterMetadata::empty();
        for (id, rack) in [(1, "rack1"), (2, "rack2"), (3, "rack3"), (4, "rack4")] {
            let t = Transformation::RegisterNode {
                node: NodeId(id),
                addr: NodeAddr(format!("10.0.0.{}:7433", id)),
                location: Location::new("dc1", rack),
            };
            t.validate(&metadata, env(&extensions)).unwrap();
            metadata = t
                .apply(&metadata, env(&extensions))
                .with_epoch(metadata.epoch.next());
        }
        let t = Transformation::AlterReplication {
            keyspace: "app".into(),
            params: ReplicationParams::network_topology([("dc1", 3)]),
        };
        t.validate(&metadata, env(&extensions)).unwrap();
        metadata = t
            .apply(&metadata, env(&extensions))
            .with_epoch(metadata.epoch.next());
        (metadata, extensions)
    }

    fn alter(node: u32, dc: &str, rack: &str) -> Transformation {
        Transformation::AlterTopology {
            updates: BTreeMap::from([(NodeId(node), Location::new(dc, rack))]),
        }
    }

    #[test]
    fn placement_safe_rename_is_accepted_and_applied() {
        let (metadata, extensions) = bootstrap();
        let t = alter(1, "dc1", "rack99");
        t.validate(&metadata, env(&extensions)).unwrap();

        let next = t.apply(&metadata, env(&extensions)).with_epoch(metadata.epoch.next());
        assert_eq!(
            next.directory.location(NodeId(1)),
            Some(&Location::new("dc1", "rack99"))
        );
        assert_eq!(next.placements, metadata.placements);
        assert_eq!(next.epoch, metadata.epoch.next());
    }

    #[test]
    fn datacenter_move_is_rejected() {
        let (metadata, extensions) = bootstrap();
        let rejection = alter(1, "dcX", "rack1")
            .validate(&metadata, env(&extensions))
            .unwrap_err();
        assert_eq!(rejection.message, REJECTED_PLACEMENT_CHANGE);
    }

    #[test]
    fn rack_collision_is_rejected() {
        let (metadata, extensions) = bootstrap();
        let rejection = alter(1, "dc1", "rack2")
            .validate(&metadata, env(&extensions))
            .unwrap_err();
        assert_eq!(rejection.message, REJECTED_PLACEMENT_CHANGE);
    }

    #[test]
    fn lock_check_precedes_placement_check() {
        let (metadata, extensions) = bootstrap();
        let key = LockKey::for_epoch(metadata.epoch.next());
        let locked = Transformation::LockRanges {
            key,
            ranges: AffectedRanges::full_ring(),
        }
        .apply(&metadata, env(&extensions));

        // placement-safe, but locks win
        let rejection = alter(1, "dc1", "rack99")
            .validate(&locked, env(&extensions))
            .unwrap_err();
        assert_eq!(rejection.message, REJECTED_ONGOING_MOVEMENTS);
    }

    #[test]
    fn unknown_node_is_a_malformed_proposal() {
        let (metadata, extensions) = bootstrap();
        let rejection = alter(42, "dc1", "rack1")
            .validate(&metadata, env(&extensions))
            .unwrap_err();
        assert!(rejection.message.contains("not present in the directory"));
    }

    #[test]
    fn multi_node_rename_applies_atomically() {
        let (metadata, extensions) = bootstrap();
        let updates: BTreeMap<NodeId, Location> = metadata
            .directory
            .peer_ids()
            .map(|n| (n, Location::new("dc1", format!("rack{}", n.id() + 100))))
            .collect();
        let t = Transformation::AlterTopology { updates };
        t.validate(&metadata, env(&extensions)).unwrap();

        let next = t.apply(&metadata, env(&extensions));
        for node in next.directory.peer_ids() {
            assert_eq!(
                next.directory.location(node).unwrap().rack,
                format!("rack{}", node.id() + 100)
            );
        }
        assert_eq!(next.placements, metadata.placements);
    }

    #[test]
    fn two_step_datacenter_rename() {
        let (metadata, extensions) = bootstrap();

        // straight rename: the keyspace references dc1, so it is rejected
        let updates: BTreeMap<NodeId, Location> = metadata
            .directory
            .peer_ids()
            .map(|n| {
                let rack = metadata.directory.location(n).unwrap().rack.clone();
                (n, Location::new("renamed_dc", rack))
            })
            .collect();
        let rename = Transformation::AlterTopology {
            updates: updates.clone(),
        };
        let rejection = rename.validate(&metadata, env(&extensions)).unwrap_err();
        assert_eq!(rejection.message, REJECTED_PLACEMENT_CHANGE);

        // step one: re-point replication away from the datacenter name
        let step_one = Transformation::AlterReplication {
            keyspace: "app".into(),
            params: ReplicationParams::simple(3),
        };
        step_one.validate(&metadata, env(&extensions)).unwrap();
        let metadata = step_one
            .apply(&metadata, env(&extensions))
            .with_epoch(metadata.epoch.next());

        // step two: the rename no longer touches any referenced datacenter
        rename.validate(&metadata, env(&extensions)).unwrap();
        let renamed = rename.apply(&metadata, env(&extensions));
        for node in renamed.directory.peer_ids() {
            assert_eq!(
                renamed.directory.location(node).unwrap().datacenter,
                "renamed_dc"
            );
        }
    }

    #[test]
    fn identical_reregistration_is_a_no_op_success() {
        let (metadata, extensions) = bootstrap();
        let t = Transformation::RegisterNode {
            node: NodeId(1),
            addr: NodeAddr("10.0.0.1:7433".into()),
            location: Location::new("dc1", "rack1"),
        };
        t.validate(&metadata, env(&extensions)).unwrap();
        let next = t.apply(&metadata, env(&extensions));
        assert_eq!(next.directory, metadata.directory);

        let conflicting = Transformation::RegisterNode {
            node: NodeId(1),
            addr: NodeAddr("10.0.0.1:7433".into()),
            location: Location::new("dc7", "rack1"),
        };
        assert!(conflicting.validate(&metadata, env(&extensions)).is_err());
    }

    #[test]
    fn unlock_of_unlocked_ranges_succeeds_unchanged() {
        let (metadata, extensions) = bootstrap();
        let t = Transformation::UnlockRanges {
            key: LockKey::for_epoch(Epoch::new(99)),
        };
        t.validate(&metadata, env(&extensions)).unwrap();
        let next = t.apply(&metadata, env(&extensions));
        assert_eq!(next.directory, metadata.directory);
        assert_eq!(next.placements, metadata.placements);
        assert!(next.locked_ranges.is_empty());
    }

    #[test]
    fn unregistered_custom_transformation_is_rejected() {
        let (metadata, extensions) = bootstrap();
        let t = Transformation::Custom {
            name: "not-registered".into(),
            payload: serde_json::Value::Null,
        };
        let rejection = t.validate(&metadata, env(&extensions)).unwrap_err();
        assert!(rejection.message.contains("Unknown custom transformation"));
    }

    #[test]
    fn replication_referencing_unknown_datacenter_is_rejected() {
        let (metadata, extensions) = bootstrap();
        let t = Transformation::AlterReplication {
            keyspace: "app".into(),
            params: ReplicationParams::network_topology([("dc_missing", 3)]),
        };
        let rejection = t.validate(&metadata, env(&extensions)).unwrap_err();
        assert!(rejection.message.contains("unknown datacenter"));
    }
}
