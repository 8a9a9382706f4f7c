//! Shared test helpers for `meridian-cms` integration tests.
//!
//! Provides a [`start_cluster`] function that wires N CMS nodes over an
//! in-memory network, bootstraps the directory and a test keyspace through
//! the metadata log, and waits for every node to converge. The first node
//! listed is the metadata authority.

use std::sync::Arc;
use std::time::Duration;

use meridian_cms::fetch::FetchConfig;
use meridian_cms::node::{CmsNode, CmsNodeConfig};
use meridian_cms::transport::InMemoryNetwork;

use meridian_core::metadata::ClusterMetadata;
use meridian_core::sequences::{AffectedRanges, LockKey, LockedRanges};
use meridian_core::transform::CustomExtension;
use meridian_core::{
    ExtensionRegistry, Location, NodeAddr, NodeId, Rejection, ReplicationParams,
    TokenRingPlacement, Transformation,
};

pub const KEYSPACE: &str = "app";

/// Extension that locks the full ring, standing in for an in-flight range
/// movement without actually initiating one. Whatever is locked, proposals
/// rejected in the presence of locks are rejected the same way.
pub struct LockTestRanges;

pub const LOCK_TEST_RANGES: &str = "test_lock_ranges";

impl CustomExtension for LockTestRanges {
    fn validate(
        &self,
        _payload: &serde_json::Value,
        _metadata: &ClusterMetadata,
    ) -> Result<(), Rejection> {
        Ok(())
    }

    fn apply(&self, _payload: &serde_json::Value, metadata: &ClusterMetadata) -> ClusterMetadata {
        let key = LockKey::for_epoch(metadata.epoch);
        metadata.with_locked_ranges(
            metadata
                .locked_ranges
                .lock(key, AffectedRanges::full_ring()),
        )
    }
}

/// Extension that clears every lock, standing in for movement completion.
pub struct ClearLockedTestRanges;

pub const CLEAR_LOCKED_TEST_RANGES: &str = "test_clear_locked_ranges";

impl CustomExtension for ClearLockedTestRanges {
    fn validate(
        &self,
        _payload: &serde_json::Value,
        _metadata: &ClusterMetadata,
    ) -> Result<(), Rejection> {
        Ok(())
    }

    fn apply(&self, _payload: &serde_json::Value, metadata: &ClusterMetadata) -> ClusterMetadata {
        metadata.with_locked_ranges(LockedRanges::EMPTY)
    }
}

pub fn test_extensions() -> ExtensionRegistry {
    let extensions = ExtensionRegistry::new();
    extensions.register(LOCK_TEST_RANGES, Arc::new(LockTestRanges));
    extensions.register(CLEAR_LOCKED_TEST_RANGES, Arc::new(ClearLockedTestRanges));
    extensions
}

pub fn custom(name: &str) -> Transformation {
    Transformation::Custom {
        name: name.to_string(),
        payload: serde_json::Value::Null,
    }
}

pub struct TestCluster {
    pub net: InMemoryNetwork,
    pub nodes: Vec<CmsNode>,
}

impl TestCluster {
    /// The metadata authority (always the first node given to
    /// [`start_cluster`]).
    pub fn authority(&self) -> &CmsNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: u32) -> &CmsNode {
        self.nodes
            .iter()
            .find(|n| n.node_id() == NodeId(id))
            .expect("node id exists in cluster")
    }

    /// Wait until every node has applied everything the authority committed.
    pub async fn quiesce(&self) {
        let target = self.authority().epoch();
        for node in &self.nodes {
            node.await_epoch(target, Duration::from_secs(10))
                .await
                .unwrap_or_else(|e| panic!("{} did not reach {}: {}", node.node_id(), target, e));
        }
    }
}

/// Fast-turnaround fetch tuning for tests.
pub fn test_fetch_config() -> FetchConfig {
    FetchConfig {
        request_timeout: Duration::from_millis(250),
        retry_interval: Duration::from_millis(20),
        retry_jitter: Duration::from_millis(10),
        max_rounds: 50,
    }
}

/// Start a cluster with the given `(node id, datacenter, rack)` layout and a
/// keyspace replicated with `params`. Registrations and the keyspace flow
/// through the log like any other transformation, so followers converge on
/// the bootstrap state via the regular push/fetch paths.
pub async fn start_cluster(
    layout: &[(u32, &str, &str)],
    params: ReplicationParams,
) -> TestCluster {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let net = InMemoryNetwork::new();
    let authority = NodeId(layout[0].0);

    let mut nodes = Vec::with_capacity(layout.len());
    for (id, dc, rack) in layout {
        let node = CmsNode::start(
            CmsNodeConfig {
                node_id: NodeId(*id),
                addr: NodeAddr(format!("10.0.0.{}:7433", id)),
                location: Location::new(*dc, *rack),
                authority,
                fetch: test_fetch_config(),
            },
            Arc::new(net.clone()),
            Arc::new(TokenRingPlacement),
            test_extensions(),
        )
        .expect("start CMS node");
        net.register(NodeId(*id), node.handler());
        nodes.push(node);
    }

    let cluster = TestCluster { net, nodes };

    for node in &cluster.nodes {
        cluster
            .authority()
            .commit(node.registration())
            .await
            .expect("register node");
    }

    cluster
        .authority()
        .commit(Transformation::AlterReplication {
            keyspace: KEYSPACE.to_string(),
            params,
        })
        .await
        .expect("create test keyspace");

    cluster.quiesce().await;
    cluster
}

/// The four-rack single-datacenter layout most topology tests start from.
pub async fn four_rack_cluster() -> TestCluster {
    start_cluster(
        &[
            (1, "dc1", "rack1"),
            (2, "dc1", "rack2"),
            (3, "dc1", "rack3"),
            (4, "dc1", "rack4"),
        ],
        ReplicationParams::network_topology([("dc1", 3)]),
    )
    .await
}
