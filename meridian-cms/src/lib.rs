//! `meridian-cms` — the Meridian cluster metadata service.
//!
//! Orders proposed [`Transformation`]s into a single, linearizable,
//! epoch-versioned log, applies them to an immutable metadata snapshot, and
//! propagates committed entries to every node: push on commit, pull (peer
//! log fetch) for recovery.
//!
//! [`Transformation`]: meridian_core::Transformation

pub mod fetch;
pub mod log;
pub mod node;
pub mod replicator;
pub mod service;
pub mod transport;
pub mod watch;

pub use fetch::FetchConfig;
pub use log::LogEntry;
pub use node::{CmsNode, CmsNodeConfig};
pub use service::{ClusterMetadataService, LagSignal};
pub use transport::{
    FetchPeerLog, FetchResponse, InMemoryNetwork, MetadataTransport, Replication,
    ReplicationHandler, WIRE_VERSION,
};
pub use watch::MetadataStream;
