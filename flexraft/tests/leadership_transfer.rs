use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use flexraft::Config;
use flexraft::State;
use maplit::btreeset;

use fixtures::RaftRouter;

mod fixtures;

/// Leadership transfer to a chosen voter.
///
/// What does this test do?
///
/// - brings a 3 voter cluster online and writes some entries.
/// - transfers leadership to a chosen follower.
/// - asserts that the transferee, once its log is current, receives TimeoutNow and wins
///   the disruptive election, that the old leader observes it and completes the
///   transfer, and that the cluster stays writable.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer_to_target() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let mut want = router.new_cluster(node_ids.clone()).await?;

    let leader = router.leader().await.expect("leader not found");
    router.client_request_many(leader, "client", 20).await;
    want += 20;
    router.wait_for_log(&node_ids, want, fixtures::timeout(), "writes").await?;

    let target = *node_ids.iter().find(|id| **id != leader).unwrap();
    tracing::info!("--- transferring leadership from {} to {}", leader, target);
    let transferee = router.transfer_leadership(leader, target).await?;
    assert_eq!(transferee, target);

    router.wait_for_state(&btreeset![target], State::Leader, fixtures::timeout(), "transferee leads").await?;
    router.wait_for_state(&btreeset![leader], State::Follower, fixtures::timeout(), "old leader follows").await?;

    // The new leader's term anchor commits and the cluster keeps accepting writes.
    router.wait_for_metrics(
        &target,
        |m| m.current_leader == Some(target),
        fixtures::timeout(),
        "new leader settled",
    )
    .await?;
    router.client_request_many(target, "client2", 10).await;

    let metrics = router.wait(&target, fixtures::timeout()).await?.metrics(
        |m| m.last_applied >= want + 10,
        "writes after transfer",
    )
    .await?;
    assert!(metrics.current_term > 1);

    Ok(())
}

/// Transfer with an unspecified target picks an up-to-date voter.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer_auto_target() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let want = router.new_cluster(node_ids.clone()).await?;
    router.wait_for_log(&node_ids, want, fixtures::timeout(), "cluster formed").await?;

    let leader = router.leader().await.expect("leader not found");
    let transferee = router.transfer_leadership(leader, 0).await?;
    assert_ne!(transferee, leader);
    assert!(node_ids.contains(&transferee));

    router.wait_for_state(&btreeset![transferee], State::Leader, fixtures::timeout(), "transferee leads").await?;
    Ok(())
}
