use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use flexraft::membership::ConfigurationPhase;
use flexraft::membership::ServerRole;
use flexraft::Config;
use maplit::btreeset;

use fixtures::RaftRouter;

mod fixtures;

/// Joint-consensus promotion with atomic removal.
///
/// What does this test do?
///
/// - brings a 3 voter cluster {0, 1, 2} online and adds server 3 as a spare.
/// - issues `joint_promote(3, Voter, remove=2)`: the configuration enters the JOINT
///   phase with 3 promoted in the NEW group and 2 absent from it.
/// - asserts that the joint entry commits (requiring majorities in both groups), that
///   the leader collapses the configuration with a follow-up CHANGE, and that the final
///   configuration holds 3 as a voter with 2 gone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joint_promote_and_remove() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let mut want = router.new_cluster(node_ids.clone()).await?;

    let leader = router.leader().await.expect("leader not found");
    let remove = *node_ids.iter().filter(|id| **id != leader).last().unwrap();

    tracing::info!("--- adding server 3 as spare");
    router.new_raft_node(3).await;
    router.add_server(leader, 3).await?;
    want += 1;

    tracing::info!("--- joint promoting 3 to voter, removing {}", remove);
    let joint_index = router.joint_promote(leader, 3, ServerRole::Voter, remove).await?;
    assert!(joint_index > want);
    // The joint entry plus the collapsing entry.
    want = joint_index + 1;

    let survivors: BTreeSet<u64> = btreeset![leader, 3];
    router.wait_for_log(&survivors, want, fixtures::timeout(), "joint transition complete").await?;

    let metrics = router.wait(&leader, fixtures::timeout()).await?.log(want, "collapsed").await?;
    assert_eq!(metrics.membership_config.phase, ConfigurationPhase::Normal);
    assert_eq!(metrics.membership_config.server_role(3), Some(ServerRole::Voter));
    assert!(!metrics.membership_config.contains(remove));

    // The new configuration commits client traffic with its own quorum.
    router.client_request_many(leader, "client", 10).await;
    want += 10;
    router.wait_for_log(&survivors, want, fixtures::timeout(), "writes after transition").await?;

    Ok(())
}

/// A joint promotion of a lagging spare runs catch-up rounds before the joint entry is
/// appended.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joint_promote_catches_up_first() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let mut want = router.new_cluster(node_ids.clone()).await?;

    let leader = router.leader().await.expect("leader not found");
    let remove = *node_ids.iter().filter(|id| **id != leader).last().unwrap();

    router.new_raft_node(3).await;
    router.add_server(leader, 3).await?;
    want += 1;

    // A backlog the promotee must replicate before the change is submitted.
    router.client_request_many(leader, "client", 40).await;
    want += 40;
    router.wait_for_log(&node_ids, want, fixtures::timeout(), "backlog").await?;

    let joint_index = router.joint_promote(leader, 3, ServerRole::Voter, remove).await?;
    want = joint_index + 1;

    let survivors: BTreeSet<u64> = btreeset![leader, 3];
    router.wait_for_log(&survivors, want, fixtures::timeout(), "caught up and transitioned").await?;

    let sto = router.get_storage_handle(&3).await?;
    let log = sto.get_log().await;
    assert!(log.len() as u64 >= want, "promotee must hold the full log");

    Ok(())
}
