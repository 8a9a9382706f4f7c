//! Peer-log catch-up — the pull half of metadata replication.
//!
//! A node that learns of a higher epoch than its own fetches the missing log
//! suffix from peers. Target ordering matters in multi-datacenter clusters:
//! when a whole datacenter lags (a partition healed, a rack rebooted), the
//! local peers are all behind by the same amount, and letting them answer
//! each other's fetches would just echo stale logs around the datacenter.
//! Responders therefore refuse to serve epochs they do not have (see
//! [`FetchResponse::Behind`]), and requesters try the known committer first.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use meridian_core::{Directory, Epoch, MetadataError, NodeId, Result};

use crate::service::ClusterMetadataService;
use crate::transport::{FetchPeerLog, FetchResponse, MetadataTransport};

/// Whether a responder at `local` may answer a fetch for epochs after
/// `since`. A responder that has nothing beyond the requester must refuse,
/// otherwise equally-lagging peers satisfy each other and never converge.
pub fn should_serve(local: Epoch, since: Epoch) -> bool {
    local > since
}

/// Fetch targets in preference order: the known committer first (it holds
/// the entry by definition), then same-datacenter peers (cheap hop), then
/// everyone else.
pub fn fetch_candidates(
    directory: &Directory,
    requester: NodeId,
    committer: Option<NodeId>,
) -> Vec<NodeId> {
    let my_dc = directory
        .location(requester)
        .map(|l| l.datacenter.clone());

    let mut rest: Vec<NodeId> = directory
        .peer_ids()
        .filter(|n| *n != requester && Some(*n) != committer)
        .collect();
    rest.sort_by_key(|n| {
        let same_dc = match (&my_dc, directory.location(*n)) {
            (Some(mine), Some(theirs)) => *mine == theirs.datacenter,
            _ => false,
        };
        (!same_dc, *n)
    });

    let mut ordered = Vec::with_capacity(rest.len() + 1);
    if let Some(c) = committer {
        // The hint is usable even before this node has applied the epoch
        // that registered the committer — a bootstrapping node has an empty
        // directory and only the hint to go on.
        if c != requester {
            ordered.push(c);
        }
    }
    ordered.extend(rest);
    ordered
}

/// Tuning for the catch-up loop.
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Per-request deadline; an expired request counts as a miss and the
    /// next candidate is tried.
    pub request_timeout: Duration,
    /// Pause between full candidate rounds.
    pub retry_interval: Duration,
    /// Random extra pause added to `retry_interval`, de-synchronizing peers
    /// that started lagging together.
    pub retry_jitter: Duration,
    /// Candidate rounds before giving up; the next lag signal starts over.
    pub max_rounds: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            retry_interval: Duration::from_millis(100),
            retry_jitter: Duration::from_millis(50),
            max_rounds: 10,
        }
    }
}

/// Pull missing entries until the local epoch reaches `target` (or rounds
/// are exhausted). Returns the local epoch on completion.
pub async fn catch_up(
    service: &Arc<ClusterMetadataService>,
    transport: &dyn MetadataTransport,
    target: Epoch,
    committer: Option<NodeId>,
    config: &FetchConfig,
) -> Result<Epoch> {
    let me = service.node_id();
    // Peers that answered `Behind`: skipped until candidates run dry, since
    // they may well have caught up while we were retrying.
    let mut behind: BTreeSet<NodeId> = BTreeSet::new();
    // A `Behind` redirect can carry a better target than our own guess.
    let mut preferred = committer;

    for round in 0..config.max_rounds {
        if service.epoch() >= target {
            return Ok(service.epoch());
        }

        let directory = service.current().directory;
        let mut candidates = fetch_candidates(&directory, me, preferred);
        candidates.retain(|c| !behind.contains(c));
        if candidates.is_empty() {
            behind.clear();
            candidates = fetch_candidates(&directory, me, preferred);
        }

        for candidate in candidates {
            let request = FetchPeerLog::since(me, service.epoch());
            let response = tokio::time::timeout(
                config.request_timeout,
                transport.fetch(candidate, request),
            )
            .await;

            match response {
                Ok(Ok(FetchResponse::Entries(entries))) => {
                    service.apply_replicated(entries).await?;
                    if service.epoch() >= target {
                        debug!(epoch = %service.epoch(), "caught up");
                        return Ok(service.epoch());
                    }
                }
                Ok(Ok(FetchResponse::Behind { latest, retry_hint })) => {
                    debug!(peer = %candidate, %latest, "peer refused fetch, also behind");
                    behind.insert(candidate);
                    if let Some(hint) = retry_hint {
                        if hint != me && !behind.contains(&hint) {
                            preferred = Some(hint);
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(peer = %candidate, error = %e, "fetch failed, trying next peer");
                }
                Err(_) => {
                    debug!(peer = %candidate, "fetch timed out, trying next peer");
                }
            }
        }

        let jitter_ms = config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        debug!(round, target = %target, local = %service.epoch(), "fetch round exhausted, retrying");
        sleep(config.retry_interval + jitter).await;
    }

    if service.epoch() >= target {
        Ok(service.epoch())
    } else {
        warn!(target = %target, local = %service.epoch(), "catch-up gave up for now");
        Err(MetadataError::FetchTimeout(
            (config.retry_interval + config.request_timeout) * config.max_rounds,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{Location, NodeAddr};

    #[test]
    fn responder_refuses_when_not_ahead() {
        assert!(should_serve(Epoch::new(5), Epoch::new(3)));
        assert!(!should_serve(Epoch::new(3), Epoch::new(3)));
        assert!(!should_serve(Epoch::new(2), Epoch::new(3)));
    }

    fn two_dc_directory() -> Directory {
        let mut dir = Directory::EMPTY;
        for (id, dc) in [(1, "dc1"), (2, "dc1"), (3, "dc2"), (4, "dc2"), (5, "dc2")] {
            dir = dir.with_peer(
                NodeId(id),
                NodeAddr(format!("10.0.0.{}:7433", id)),
                Location::new(dc, format!("rack{}", id)),
            );
        }
        dir
    }

    #[test]
    fn committer_is_tried_first() {
        let dir = two_dc_directory();
        let order = fetch_candidates(&dir, NodeId(4), Some(NodeId(1)));
        assert_eq!(order.first(), Some(&NodeId(1)));
        assert!(!order.contains(&NodeId(4)), "never fetch from yourself");
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn same_datacenter_peers_come_before_remote_ones() {
        let dir = two_dc_directory();
        // no committer known: dc2 requester should try dc2 siblings first
        let order = fetch_candidates(&dir, NodeId(4), None);
        assert_eq!(
            order,
            vec![NodeId(3), NodeId(5), NodeId(1), NodeId(2)]
        );
    }

    #[test]
    fn committer_hint_works_without_membership() {
        // A node still bootstrapping has an empty directory; the committer
        // carried by the push must remain a usable target.
        let order = fetch_candidates(&Directory::EMPTY, NodeId(2), Some(NodeId(99)));
        assert_eq!(order, vec![NodeId(99)]);
    }
}
