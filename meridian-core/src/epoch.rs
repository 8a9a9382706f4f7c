//! Epoch — the monotonic version of a cluster metadata snapshot.
//!
//! Every committed transformation produces a snapshot at exactly the next
//! epoch. Two snapshots observed anywhere in the cluster with the same epoch
//! are the same value; the higher epoch is always causally later.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic version identifier of a [`ClusterMetadata`] snapshot.
///
/// [`ClusterMetadata`]: crate::metadata::ClusterMetadata
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Epoch(u64);

impl Epoch {
    /// The pre-bootstrap epoch. No transformation has been committed yet.
    pub const EMPTY: Epoch = Epoch(0);

    /// The epoch produced by the first committed transformation.
    pub const FIRST: Epoch = Epoch(1);

    pub const fn new(v: u64) -> Self {
        Epoch(v)
    }

    /// The epoch the next committed transformation will produce.
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    pub fn is_after(self, other: Epoch) -> bool {
        self.0 > other.0
    }

    pub fn is_before(self, other: Epoch) -> bool {
        self.0 < other.0
    }

    /// Raw value, for logging and wire encoding.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}
