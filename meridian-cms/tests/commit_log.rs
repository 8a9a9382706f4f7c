//! Commit-path tests — log ordering, authority gating, the snapshot watch
//! stream, and custom transformations flowing through replication.

mod common;

use std::collections::BTreeMap;

use futures::StreamExt;
use meridian_core::sequences::LockKey;
use meridian_core::{Epoch, Location, NodeId, RejectionCode, Transformation};

use common::{custom, four_rack_cluster, CLEAR_LOCKED_TEST_RANGES, LOCK_TEST_RANGES};

fn relocate(node: u32, dc: &str, rack: &str) -> Transformation {
    Transformation::AlterTopology {
        updates: BTreeMap::from([(NodeId(node), Location::new(dc, rack))]),
    }
}

#[tokio::test]
async fn committed_epochs_are_dense_and_strictly_increasing() {
    let cluster = four_rack_cluster().await;
    let authority = cluster.authority();
    let start = authority.epoch();

    for i in 0..5u32 {
        let metadata = authority
            .commit(relocate(1, "dc1", &format!("rack{}", 60 + i)))
            .await
            .expect("placement-safe rename");
        assert_eq!(metadata.epoch, Epoch::new(start.value() + u64::from(i) + 1));
    }

    let epochs: Vec<u64> = authority
        .service
        .log_suffix(Epoch::EMPTY)
        .await
        .iter()
        .map(|e| e.epoch.value())
        .collect();
    let expected: Vec<u64> = (1..=authority.epoch().value()).collect();
    assert_eq!(epochs, expected, "no gaps, no duplicates");
}

#[tokio::test]
async fn followers_reject_commits_with_a_stable_message() {
    let cluster = four_rack_cluster().await;
    let rejection = cluster
        .node(2)
        .commit(relocate(1, "dc1", "rack99"))
        .await
        .expect_err("only the authority sequences commits");
    assert_eq!(rejection.code, RejectionCode::Invalid);
    assert_eq!(
        rejection.message,
        "commits must be submitted to the metadata authority node"
    );
    assert_eq!(
        cluster.node(2).epoch(),
        cluster.authority().epoch(),
        "the rejected proposal left no trace anywhere"
    );
}

#[tokio::test]
async fn watch_stream_yields_snapshots_in_epoch_order() {
    let cluster = four_rack_cluster().await;
    let authority = cluster.authority();

    let mut stream = cluster.node(3).service.metadata_stream();
    let first = stream.next().await.expect("current snapshot");
    let mut last_seen = first.epoch;

    authority
        .commit(relocate(1, "dc1", "rack70"))
        .await
        .expect("rename");
    authority
        .commit(relocate(1, "dc1", "rack71"))
        .await
        .expect("rename");
    cluster.quiesce().await;

    let target = authority.epoch();
    while last_seen < target {
        let snapshot = stream.next().await.expect("stream stays open");
        assert!(
            snapshot.epoch > last_seen,
            "snapshots must arrive in commit order"
        );
        last_seen = snapshot.epoch;
    }
    assert_eq!(last_seen, target);
}

#[tokio::test]
async fn custom_transformations_replicate_like_any_other_entry() {
    let cluster = four_rack_cluster().await;
    let authority = cluster.authority();

    authority
        .commit(custom(LOCK_TEST_RANGES))
        .await
        .expect("lock via extension");
    cluster.quiesce().await;
    for node in &cluster.nodes {
        assert!(
            !node.metadata().locked_ranges.is_empty(),
            "{} did not apply the extension entry",
            node.node_id()
        );
    }

    authority
        .commit(custom(CLEAR_LOCKED_TEST_RANGES))
        .await
        .expect("clear via extension");
    cluster.quiesce().await;
    for node in &cluster.nodes {
        assert!(node.metadata().locked_ranges.is_empty());
    }
}

#[tokio::test]
async fn unknown_custom_transformation_is_rejected_at_commit() {
    let cluster = four_rack_cluster().await;
    let rejection = cluster
        .authority()
        .commit(custom("nobody_registered_this"))
        .await
        .expect_err("unregistered extension cannot commit");
    assert!(rejection
        .message
        .contains("Unknown custom transformation"));
}

#[tokio::test]
async fn native_lock_and_unlock_round_trip_through_the_log() {
    let cluster = four_rack_cluster().await;
    let authority = cluster.authority();

    let key = LockKey::for_epoch(authority.epoch().next());
    authority
        .commit(Transformation::LockRanges {
            key,
            ranges: meridian_core::AffectedRanges::full_ring(),
        })
        .await
        .expect("lock commits unconditionally");
    assert!(authority.metadata().locked_ranges.contains(key));

    authority
        .commit(Transformation::UnlockRanges { key })
        .await
        .expect("unlock commits unconditionally");
    assert!(authority.metadata().locked_ranges.is_empty());

    // unlocking again is a successful no-op commit, not an error
    let before = authority.metadata();
    let after = authority
        .commit(Transformation::UnlockRanges { key })
        .await
        .expect("repeated unlock stays safe to retry");
    assert_eq!(after.epoch, before.epoch.next());
    assert_eq!(after.directory, before.directory);
    assert_eq!(after.placements, before.placements);

    cluster.quiesce().await;
    for node in &cluster.nodes {
        assert!(node.metadata().locked_ranges.is_empty());
    }
}
