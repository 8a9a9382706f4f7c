//! `meridian-core` — shared metadata model for the Meridian cluster
//! metadata service.
//!
//! Defines the epoch-versioned [`ClusterMetadata`](metadata::ClusterMetadata)
//! snapshot, the membership [`Directory`](membership::Directory), derived data
//! [`Placement`](ownership::Placement)s, the
//! [`LockedRanges`](sequences::LockedRanges) movement guard, and the
//! [`Transformation`](transform::Transformation)s that mutate all of the
//! above through the metadata log.

pub mod epoch;
pub mod errors;
pub mod membership;
pub mod metadata;
pub mod ownership;
pub mod sequences;
pub mod transform;

pub use epoch::Epoch;
pub use errors::{MetadataError, Rejection, RejectionCode, Result};
pub use membership::{Directory, Location, NodeAddr, NodeId};
pub use metadata::ClusterMetadata;
pub use ownership::{
    DataPlacements, Placement, PlacementProvider, ReplicationParams, TokenRange,
    TokenRingPlacement,
};
pub use sequences::{AffectedRanges, LockKey, LockedRanges};
pub use transform::{
    CustomExtension, ExtensionRegistry, Kind, TransformEnv, Transformation,
    REJECTED_ONGOING_MOVEMENTS, REJECTED_PLACEMENT_CHANGE,
};
