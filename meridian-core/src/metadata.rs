//! ClusterMetadata — the immutable, epoch-versioned metadata snapshot.
//!
//! A snapshot is produced by applying exactly one committed transformation to
//! its predecessor. Snapshots are superseded, never mutated: readers holding
//! one always see a consistent view at some epoch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;
use crate::membership::Directory;
use crate::ownership::{DataPlacements, Placement, PlacementProvider, ReplicationParams};
use crate::sequences::LockedRanges;

/// The aggregate cluster metadata at one epoch.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub epoch: Epoch,
    pub directory: Directory,
    /// Keyspace replication parameters, the schema slice the CMS owns.
    pub keyspaces: BTreeMap<String, ReplicationParams>,
    /// Derived replica groups per keyspace. Always consistent with
    /// `(directory, keyspaces)` — recomputed whenever either changes.
    pub placements: DataPlacements,
    pub locked_ranges: LockedRanges,
    /// Marker bumped on every schema (replication) change; lets collaborators
    /// detect schema movement without diffing keyspace maps.
    pub schema_version: u64,
}

impl ClusterMetadata {
    /// The pre-bootstrap snapshot: empty directory, no keyspaces, no locks.
    pub fn empty() -> Self {
        Self {
            epoch: Epoch::EMPTY,
            directory: Directory::EMPTY,
            keyspaces: BTreeMap::new(),
            placements: BTreeMap::new(),
            locked_ranges: LockedRanges::EMPTY,
            schema_version: 0,
        }
    }

    pub fn placement(&self, keyspace: &str) -> Option<&Placement> {
        self.placements.get(keyspace)
    }

    /// The same snapshot stamped with a new epoch. Used by the commit path
    /// after `apply`; everything but the version is untouched.
    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    /// Successor snapshot with a replaced directory and placements recomputed
    /// for every keyspace.
    pub fn with_directory(
        &self,
        directory: Directory,
        provider: &dyn PlacementProvider,
    ) -> Self {
        let placements = self
            .keyspaces
            .iter()
            .map(|(name, params)| (name.clone(), provider.compute(&directory, params)))
            .collect();
        Self {
            epoch: self.epoch,
            directory,
            keyspaces: self.keyspaces.clone(),
            placements,
            locked_ranges: self.locked_ranges.clone(),
            schema_version: self.schema_version,
        }
    }

    /// Successor snapshot with one keyspace's replication replaced (or
    /// created) and its placement recomputed. Bumps the schema marker.
    pub fn with_replication(
        &self,
        keyspace: &str,
        params: ReplicationParams,
        provider: &dyn PlacementProvider,
    ) -> Self {
        let mut keyspaces = self.keyspaces.clone();
        let mut placements = self.placements.clone();
        placements.insert(
            keyspace.to_string(),
            provider.compute(&self.directory, &params),
        );
        keyspaces.insert(keyspace.to_string(), params);
        Self {
            epoch: self.epoch,
            directory: self.directory.clone(),
            keyspaces,
            placements,
            locked_ranges: self.locked_ranges.clone(),
            schema_version: self.schema_version + 1,
        }
    }

    /// Successor snapshot with replaced locked ranges.
    pub fn with_locked_ranges(&self, locked_ranges: LockedRanges) -> Self {
        Self {
            epoch: self.epoch,
            directory: self.directory.clone(),
            keyspaces: self.keyspaces.clone(),
            placements: self.placements.clone(),
            locked_ranges,
            schema_version: self.schema_version,
        }
    }
}
