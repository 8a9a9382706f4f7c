//! The Cluster Metadata Service — the single writer of cluster metadata.
//!
//! Serializes concurrent transformation proposals into one total order,
//! applies them, and exposes the current snapshot through an atomically
//! swapped state cell (a `tokio::sync::watch` channel: this service is the
//! sole sender, any component may subscribe). Readers never observe a
//! half-applied transformation.
//!
//! The total-order sequencer backing `commit` is the in-process lock of the
//! designated authority node; a consensus-backed sequencer is a collaborator
//! that slots in behind the same contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use meridian_core::transform::{TransformEnv, Transformation};
use meridian_core::{
    ClusterMetadata, Epoch, ExtensionRegistry, MetadataError, NodeId, PlacementProvider,
    Rejection, Result,
};

use crate::log::{LocalLog, LogEntry};
use crate::transport::{self, FetchPeerLog, FetchResponse, Replication, ReplicationHandler};
use crate::watch::MetadataStream;

/// Observation that the local replica is behind the cluster. Consumed by the
/// node's catch-up worker.
#[derive(Clone, Copy, Debug)]
pub struct LagSignal {
    /// Highest epoch known to have been committed.
    pub observed: Epoch,
    /// The committer that epoch was learned from, when known. Preferred
    /// fetch target.
    pub committer: Option<NodeId>,
}

pub struct ClusterMetadataService {
    node_id: NodeId,
    /// Whether this node is the metadata authority (the commit sequencer).
    authority: bool,
    provider: Arc<dyn PlacementProvider>,
    extensions: ExtensionRegistry,
    log: Mutex<LocalLog>,
    state: watch::Sender<ClusterMetadata>,
    /// Serializes commit and replicated-apply; the local sequencer seam.
    commit_lock: Mutex<()>,
    /// Committed entries queued for the replication push worker.
    committed: mpsc::UnboundedSender<LogEntry>,
    /// Lag observations queued for the catch-up worker.
    lag: mpsc::UnboundedSender<LagSignal>,
    /// Committer of the most recently received push; the `Behind` redirect
    /// hint handed to lagging peers.
    last_committer: std::sync::Mutex<Option<NodeId>>,
}

impl ClusterMetadataService {
    pub fn new(
        node_id: NodeId,
        authority: bool,
        provider: Arc<dyn PlacementProvider>,
        extensions: ExtensionRegistry,
        committed: mpsc::UnboundedSender<LogEntry>,
        lag: mpsc::UnboundedSender<LagSignal>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ClusterMetadata::empty());
        Arc::new(Self {
            node_id,
            authority,
            provider,
            extensions,
            log: Mutex::new(LocalLog::new()),
            state,
            commit_lock: Mutex::new(()),
            committed,
            lag,
            last_committer: std::sync::Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_authority(&self) -> bool {
        self.authority
    }

    /// The current snapshot. Never blocks on commit activity.
    pub fn current(&self) -> ClusterMetadata {
        self.state.borrow().clone()
    }

    pub fn epoch(&self) -> Epoch {
        self.state.borrow().epoch
    }

    /// Subscribe to committed snapshots.
    pub fn watch(&self) -> watch::Receiver<ClusterMetadata> {
        self.state.subscribe()
    }

    /// Committed snapshots as an async stream.
    pub fn metadata_stream(&self) -> MetadataStream {
        MetadataStream::from_watch(self.state.subscribe())
    }

    fn env(&self) -> TransformEnv<'_> {
        TransformEnv {
            provider: self.provider.as_ref(),
            extensions: &self.extensions,
        }
    }

    /// Propose a transformation.
    ///
    /// On success the returned snapshot is the new current metadata, at
    /// exactly the next epoch. On rejection nothing changed — the outcome is
    /// indistinguishable from the proposal never having been submitted.
    pub async fn commit(
        &self,
        transformation: Transformation,
    ) -> std::result::Result<ClusterMetadata, Rejection> {
        if !self.authority {
            return Err(Rejection::invalid(
                "commits must be submitted to the metadata authority node",
            ));
        }

        let _ordered = self.commit_lock.lock().await;
        let current = self.current();

        if let Err(rejection) = transformation.validate(&current, self.env()) {
            debug!(
                kind = %transformation.kind(),
                reason = %rejection.message,
                "proposal rejected"
            );
            return Err(rejection);
        }

        let next = transformation
            .apply(&current, self.env())
            .with_epoch(current.epoch.next());
        let entry = LogEntry {
            epoch: next.epoch,
            transform: transformation,
        };

        self.log.lock().await.append_committed(entry.clone());
        self.state.send_replace(next.clone());
        // Queue for the push worker; a full or closed queue is not a commit
        // failure, peers self-heal through fetch.
        if self.committed.send(entry.clone()).is_err() {
            warn!(epoch = %entry.epoch, "replication queue closed; peers must catch up via fetch");
        }

        info!(
            epoch = %next.epoch,
            kind = %entry.transform.kind(),
            "committed transformation"
        );
        Ok(next)
    }

    /// Continuation form of [`commit`](Self::commit), for administrative
    /// callers that branch on the outcome.
    pub async fn commit_with<R>(
        &self,
        transformation: Transformation,
        on_success: impl FnOnce(&ClusterMetadata) -> R,
        on_rejected: impl FnOnce(&Rejection) -> R,
    ) -> R {
        match self.commit(transformation).await {
            Ok(metadata) => on_success(&metadata),
            Err(rejection) => on_rejected(&rejection),
        }
    }

    /// [`commit`](Self::commit) with a caller-supplied deadline. Expiry means
    /// *unknown outcome*, not failure: the proposal may still commit, and the
    /// caller must re-read the current metadata to learn the result.
    pub async fn commit_with_timeout(
        &self,
        transformation: Transformation,
        timeout: Duration,
    ) -> std::result::Result<ClusterMetadata, Rejection> {
        match tokio::time::timeout(timeout, self.commit(transformation)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Rejection::timeout(format!(
                "commit outcome unknown after {:?}; re-read the current metadata",
                timeout
            ))),
        }
    }

    /// Apply entries received from peers. Entries extending the applied
    /// prefix are applied in epoch order; out-of-order entries are buffered.
    /// Returns the highest contiguously applied epoch.
    pub async fn apply_replicated(&self, entries: Vec<LogEntry>) -> Result<Epoch> {
        let _ordered = self.commit_lock.lock().await;
        let mut log = self.log.lock().await;
        for entry in entries {
            log.insert(entry);
        }

        let mut current = self.current();
        while let Some(entry) = log.next_ready().cloned() {
            if let Transformation::Custom { name, .. } = &entry.transform {
                if self.extensions.get(name).is_none() {
                    // Replaying a committed entry must not fail; a missing
                    // extension means this replica cannot reproduce the
                    // cluster's state and needs a full resync.
                    return Err(MetadataError::CorruptLog(format!(
                        "no extension registered for custom transformation '{}' at {}",
                        name, entry.epoch
                    )));
                }
            }
            let next = entry
                .transform
                .apply(&current, self.env())
                .with_epoch(entry.epoch);
            log.mark_applied(entry.epoch);
            self.state.send_replace(next.clone());
            debug!(
                epoch = %entry.epoch,
                kind = %entry.transform.kind(),
                "applied replicated entry"
            );
            current = next;
        }

        Ok(log.applied())
    }

    /// Report that a higher epoch than the local one has been observed (from
    /// a push, or from any collaborator message carrying an epoch). Wakes the
    /// catch-up worker.
    pub fn signal_lag(&self, observed: Epoch, committer: Option<NodeId>) {
        if observed <= self.epoch() {
            return;
        }
        let _ = self.lag.send(LagSignal {
            observed,
            committer,
        });
    }

    /// Entries after `since` from the local applied log.
    pub async fn log_suffix(&self, since: Epoch) -> Vec<LogEntry> {
        self.log.lock().await.entries_since(since)
    }

    /// Block until the local epoch reaches `target`, or time out. The
    /// quiesce primitive: strong-consistency callers gate on this.
    pub async fn await_epoch(&self, target: Epoch, timeout: Duration) -> Result<ClusterMetadata> {
        let mut rx = self.state.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|m| m.epoch >= target)).await {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(MetadataError::Transport(
                "metadata state cell closed".into(),
            )),
            Err(_) => Err(MetadataError::FetchTimeout(timeout)),
        };
        result
    }
}

#[async_trait]
impl ReplicationHandler for ClusterMetadataService {
    async fn handle_push(&self, replication: Replication) -> Result<()> {
        transport::check_version(replication.version)?;
        *self
            .last_committer
            .lock()
            .expect("last_committer lock poisoned") = Some(replication.committer);

        let observed = replication.to_epoch;
        let committer = replication.committer;
        self.apply_replicated(replication.entries).await?;

        let local = self.epoch();
        if local < observed {
            debug!(%local, %observed, "behind after push, scheduling catch-up");
            self.signal_lag(observed, Some(committer));
        }
        Ok(())
    }

    async fn handle_fetch(&self, request: FetchPeerLog) -> Result<FetchResponse> {
        transport::check_version(request.version)?;
        let local = self.epoch();
        if crate::fetch::should_serve(local, request.since) {
            let entries = self.log_suffix(request.since).await;
            debug!(
                requester = %request.requester,
                since = %request.since,
                count = entries.len(),
                "serving peer log fetch"
            );
            Ok(FetchResponse::Entries(entries))
        } else {
            // Refusing keeps equally-lagging peers from echoing each other's
            // stale logs; the requester is pointed at the committer instead.
            let last = *self
                .last_committer
                .lock()
                .expect("last_committer lock poisoned");
            let retry_hint = last.filter(|c| *c != request.requester && *c != self.node_id);
            debug!(
                requester = %request.requester,
                since = %request.since,
                %local,
                "refusing fetch, responder is behind"
            );
            Ok(FetchResponse::Behind {
                latest: local,
                retry_hint,
            })
        }
    }
}
