//! Node-to-node messages and the transport seam.
//!
//! The CMS does not own a network stack: it defines the wire payloads and the
//! [`MetadataTransport`] trait, and the hosting process supplies the actual
//! transport. [`InMemoryNetwork`] is the implementation used by tests and
//! simulations; it routes messages through the same serialized form a real
//! transport would carry and supports partition injection.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use meridian_core::{Epoch, MetadataError, NodeId, Result};

use crate::log::LogEntry;

/// Current metadata wire format version. Bumped when a message field changes
/// shape; a node never decodes a version it does not know.
pub const WIRE_VERSION: u32 = 1;

pub fn check_version(version: u32) -> Result<()> {
    if version != WIRE_VERSION {
        return Err(MetadataError::IncompatibleVersion(version));
    }
    Ok(())
}

/// Push of freshly committed entries, sent by the committing node to every
/// peer after a commit. Best-effort: a missed push is recovered by the fetch
/// protocol, never by retrying the push.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Replication {
    pub version: u32,
    /// Inclusive epoch range carried by `entries`.
    pub from_epoch: Epoch,
    pub to_epoch: Epoch,
    /// The node that committed (and therefore durably holds) these entries.
    pub committer: NodeId,
    pub entries: Vec<LogEntry>,
}

impl Replication {
    pub fn single(committer: NodeId, entry: LogEntry) -> Self {
        Self {
            version: WIRE_VERSION,
            from_epoch: entry.epoch,
            to_epoch: entry.epoch,
            committer,
            entries: vec![entry],
        }
    }
}

/// Request for the log suffix after `since`, sent by a lagging node.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FetchPeerLog {
    pub version: u32,
    pub since: Epoch,
    pub requester: NodeId,
}

impl FetchPeerLog {
    pub fn since(requester: NodeId, since: Epoch) -> Self {
        Self {
            version: WIRE_VERSION,
            since,
            requester,
        }
    }
}

/// Answer to a [`FetchPeerLog`] request.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FetchResponse {
    /// The missing entries, contiguous from the requested epoch.
    Entries(Vec<LogEntry>),
    /// The responder is itself at or behind the requested epoch and refuses
    /// to answer — ask someone else. Carries the committer the responder
    /// last heard from, if any, as a routing hint.
    Behind {
        latest: Epoch,
        retry_hint: Option<NodeId>,
    },
}

/// Transport used by the CMS to reach peers. Real deployments back this with
/// their RPC layer; tests use [`InMemoryNetwork`].
#[async_trait]
pub trait MetadataTransport: Send + Sync {
    /// Fire-and-forget replication push.
    async fn push(&self, to: NodeId, replication: Replication) -> Result<()>;

    /// Fetch missing log entries from a specific peer.
    async fn fetch(&self, from: NodeId, request: FetchPeerLog) -> Result<FetchResponse>;
}

/// Receiving side of the transport, implemented by the metadata service.
#[async_trait]
pub trait ReplicationHandler: Send + Sync {
    async fn handle_push(&self, replication: Replication) -> Result<()>;

    async fn handle_fetch(&self, request: FetchPeerLog) -> Result<FetchResponse>;
}

/// In-process transport connecting the nodes of a simulated cluster.
///
/// Messages cross a serialization boundary exactly as they would on the wire,
/// and links can be cut (`partition`) and restored (`heal`) to exercise the
/// recovery paths.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    handlers: Arc<DashMap<NodeId, Arc<dyn ReplicationHandler>>>,
    severed: Arc<DashMap<(NodeId, NodeId), ()>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, handler: Arc<dyn ReplicationHandler>) {
        self.handlers.insert(node, handler);
    }

    /// Cut the link between two nodes, both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.severed.insert((a, b), ());
        self.severed.insert((b, a), ());
        debug!(%a, %b, "link severed");
    }

    /// Restore a previously cut link.
    pub fn heal(&self, a: NodeId, b: NodeId) {
        self.severed.remove(&(a, b));
        self.severed.remove(&(b, a));
        debug!(%a, %b, "link healed");
    }

    /// Cut `node` off from every other registered node.
    pub fn isolate(&self, node: NodeId) {
        for entry in self.handlers.iter() {
            let other = *entry.key();
            if other != node {
                self.partition(node, other);
            }
        }
    }

    pub fn rejoin(&self, node: NodeId) {
        for entry in self.handlers.iter() {
            let other = *entry.key();
            if other != node {
                self.heal(node, other);
            }
        }
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn ReplicationHandler>> {
        if self.severed.contains_key(&(from, to)) {
            return Err(MetadataError::Transport(format!(
                "{} is unreachable from {}",
                to, from
            )));
        }
        self.handlers
            .get(&to)
            .map(|h| h.value().clone())
            .ok_or_else(|| MetadataError::Transport(format!("{} is not registered", to)))
    }
}

#[async_trait]
impl MetadataTransport for InMemoryNetwork {
    async fn push(&self, to: NodeId, replication: Replication) -> Result<()> {
        let handler = self.route(replication.committer, to)?;
        // Round-trip through the serialized form, as a real transport would.
        let bytes = serde_json::to_vec(&replication)?;
        let decoded: Replication = serde_json::from_slice(&bytes)?;
        handler.handle_push(decoded).await
    }

    async fn fetch(&self, from: NodeId, request: FetchPeerLog) -> Result<FetchResponse> {
        let handler = self.route(request.requester, from)?;
        let bytes = serde_json::to_vec(&request)?;
        let decoded: FetchPeerLog = serde_json::from_slice(&bytes)?;
        handler.handle_fetch(decoded).await
    }
}
