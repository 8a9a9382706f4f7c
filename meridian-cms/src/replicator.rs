//! Replication push worker.
//!
//! Forwards every locally committed entry to all known peers. Best-effort by
//! design: a push that fails or is dropped is simply logged — the peer is
//! expected to self-heal through the fetch protocol, so there is no retry
//! and no negative acknowledgement.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::log::LogEntry;
use crate::service::ClusterMetadataService;
use crate::transport::{MetadataTransport, Replication};

/// Spawn the push worker. Consumes the service's committed-entry queue until
/// the service is dropped.
pub fn spawn_replicator(
    service: Arc<ClusterMetadataService>,
    transport: Arc<dyn MetadataTransport>,
    mut committed: mpsc::UnboundedReceiver<LogEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = committed.recv().await {
            let directory = service.current().directory;
            let me = service.node_id();

            let pushes = directory.peer_ids().filter(|peer| *peer != me).map(|peer| {
                let push = Replication::single(me, entry.clone());
                let transport = transport.clone();
                async move {
                    if let Err(e) = transport.push(peer, push).await {
                        warn!(%peer, error = %e, "replication push failed; peer will fetch");
                    }
                }
            });
            join_all(pushes).await;
            debug!(epoch = %entry.epoch, "entry replicated to peers");
        }
    })
}
