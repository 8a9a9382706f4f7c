//! Locked ranges — the guard coordinating data movement with topology edits.
//!
//! While a bootstrap, decommission or move sequence is in flight, the ranges
//! it is transferring are locked. Any transformation that would alter
//! placements is rejected until the owning sequence unlocks them (or an
//! operator clears them after an abort). The guard itself is only ever
//! mutated through the commit path, so it inherits the log's linearizability;
//! there is no separate lock service.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;
use crate::ownership::TokenRange;

/// Identity of a lock, derived from the epoch at which the owning operation
/// entered the log. The operation unlocks with the same key when it finishes
/// or aborts.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct LockKey(Epoch);

impl LockKey {
    pub fn for_epoch(epoch: Epoch) -> Self {
        LockKey(epoch)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock@{}", self.0)
    }
}

/// The token ranges an in-flight operation is transferring.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct AffectedRanges {
    ranges: BTreeSet<TokenRange>,
}

impl AffectedRanges {
    pub fn new<I: IntoIterator<Item = TokenRange>>(ranges: I) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    /// Everything: used when the operation's footprint is the whole ring.
    pub fn full_ring() -> Self {
        Self::new([TokenRange::full_ring()])
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenRange> {
        self.ranges.iter()
    }
}

/// The set of currently locked ranges, keyed by owning operation.
///
/// Non-empty only while a movement sequence is active; cleared explicitly on
/// completion or abort. Locking under an existing key merges the ranges;
/// unlocking an absent key is a no-op, so cleanup can always be retried.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct LockedRanges {
    locked: BTreeMap<LockKey, AffectedRanges>,
}

impl LockedRanges {
    pub const EMPTY: LockedRanges = LockedRanges {
        locked: BTreeMap::new(),
    };

    pub fn is_empty(&self) -> bool {
        self.locked.is_empty()
    }

    pub fn contains(&self, key: LockKey) -> bool {
        self.locked.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = LockKey> + '_ {
        self.locked.keys().copied()
    }

    pub fn lock(&self, key: LockKey, ranges: AffectedRanges) -> LockedRanges {
        let mut locked = self.locked.clone();
        locked
            .entry(key)
            .and_modify(|existing| {
                let merged: Vec<TokenRange> =
                    existing.iter().chain(ranges.iter()).copied().collect();
                *existing = AffectedRanges::new(merged);
            })
            .or_insert(ranges);
        LockedRanges { locked }
    }

    pub fn unlock(&self, key: LockKey) -> LockedRanges {
        let mut locked = self.locked.clone();
        locked.remove(&key);
        LockedRanges { locked }
    }
}
