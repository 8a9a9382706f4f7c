//! CMS node lifecycle — create and start a metadata service node.
//!
//! This module is the main entry point for consumers of `meridian-cms`.
//! It wires the service, the replication push worker and the catch-up worker
//! together over a supplied transport and returns a running node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use meridian_core::{
    ClusterMetadata, Epoch, ExtensionRegistry, Location, NodeAddr, NodeId, PlacementProvider,
    Rejection, Result, Transformation,
};

use crate::fetch::{self, FetchConfig};
use crate::replicator::spawn_replicator;
use crate::service::{ClusterMetadataService, LagSignal};
use crate::transport::{MetadataTransport, ReplicationHandler};

/// Configuration for starting a CMS node.
#[derive(Clone, Debug)]
pub struct CmsNodeConfig {
    pub node_id: NodeId,
    /// Endpoint advertised in the directory once this node registers.
    pub addr: NodeAddr,
    /// Datacenter/rack this node advertises on registration.
    pub location: Location,
    /// The node serving as metadata authority (commit sequencer).
    pub authority: NodeId,
    pub fetch: FetchConfig,
}

/// A running CMS node with its background workers.
pub struct CmsNode {
    /// The metadata service backing this node.
    pub service: Arc<ClusterMetadataService>,
    node_id: NodeId,
    addr: NodeAddr,
    location: Location,
    /// Push worker join handle.
    _replicator_handle: JoinHandle<()>,
    /// Catch-up worker join handle.
    _fetch_handle: JoinHandle<()>,
}

impl CmsNode {
    /// Create and start a node. The caller still has to register the
    /// returned handler with its transport and, on a fresh cluster, commit
    /// the bootstrap transformations on the authority.
    pub fn start(
        config: CmsNodeConfig,
        transport: Arc<dyn MetadataTransport>,
        provider: Arc<dyn PlacementProvider>,
        extensions: ExtensionRegistry,
    ) -> anyhow::Result<Self> {
        if config.fetch.max_rounds == 0 {
            bail!("fetch.max_rounds must be at least 1");
        }

        // 1. Channels feeding the background workers.
        let (committed_tx, committed_rx) = mpsc::unbounded_channel();
        let (lag_tx, lag_rx) = mpsc::unbounded_channel();

        // 2. The service itself.
        let authority = config.authority == config.node_id;
        let service = ClusterMetadataService::new(
            config.node_id,
            authority,
            provider,
            extensions,
            committed_tx,
            lag_tx,
        );

        // 3. Replication push worker.
        let replicator_handle =
            spawn_replicator(service.clone(), transport.clone(), committed_rx);

        // 4. Catch-up worker.
        let fetch_handle =
            spawn_fetch_worker(service.clone(), transport, config.fetch.clone(), lag_rx);

        info!(node_id = %config.node_id, authority, "CMS node started");

        Ok(Self {
            service,
            node_id: config.node_id,
            addr: config.addr,
            location: config.location,
            _replicator_handle: replicator_handle,
            _fetch_handle: fetch_handle,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The registration transformation advertising this node's endpoint and
    /// location. Committed on the authority when the node joins the cluster.
    pub fn registration(&self) -> Transformation {
        Transformation::RegisterNode {
            node: self.node_id,
            addr: self.addr.clone(),
            location: self.location.clone(),
        }
    }

    /// Handler to register with the transport so peers can reach this node.
    pub fn handler(&self) -> Arc<dyn ReplicationHandler> {
        self.service.clone()
    }

    pub fn metadata(&self) -> ClusterMetadata {
        self.service.current()
    }

    pub fn epoch(&self) -> Epoch {
        self.service.epoch()
    }

    pub async fn commit(
        &self,
        transformation: Transformation,
    ) -> std::result::Result<ClusterMetadata, Rejection> {
        self.service.commit(transformation).await
    }

    /// Block until this node has applied everything up to `target`.
    pub async fn await_epoch(&self, target: Epoch, timeout: Duration) -> Result<ClusterMetadata> {
        self.service.await_epoch(target, timeout).await
    }
}

fn spawn_fetch_worker(
    service: Arc<ClusterMetadataService>,
    transport: Arc<dyn MetadataTransport>,
    config: FetchConfig,
    mut lag: mpsc::UnboundedReceiver<LagSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = lag.recv().await {
            if service.epoch() >= signal.observed {
                continue;
            }
            match fetch::catch_up(
                &service,
                transport.as_ref(),
                signal.observed,
                signal.committer,
                &config,
            )
            .await
            {
                Ok(epoch) => debug!(%epoch, "catch-up complete"),
                Err(e) => {
                    warn!(error = %e, "catch-up did not complete; awaiting next signal")
                }
            }
        }
    })
}
