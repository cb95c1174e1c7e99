use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use flexraft::error::ResponseError;
use flexraft::membership::ConfigurationPhase;
use flexraft::membership::ServerRole;
use flexraft::Config;
use maplit::btreeset;

use fixtures::RaftRouter;

mod fixtures;

/// Add a spare and promote it to voter through a catch-up round.
///
/// What does this test do?
///
/// - brings a 3 voter cluster online and writes a batch of entries.
/// - adds server 3 as a spare: it receives nothing.
/// - promotes it to voter: the catch-up round streams the backlog first, then the
///   configuration change commits and the new voter participates.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_add_and_promote() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let mut want = router.new_cluster(node_ids.clone()).await?;

    let leader = router.leader().await.expect("leader not found");
    router.client_request_many(leader, "client", 30).await;
    want += 30;

    tracing::info!("--- adding server 3 as spare");
    router.new_raft_node(3).await;
    router.add_server(leader, 3).await?;
    want += 1;

    // A spare receives no entries.
    let metrics = router.wait(&leader, fixtures::timeout()).await?.log(want, "spare added").await?;
    assert_eq!(metrics.membership_config.server_role(3), Some(ServerRole::Spare));
    let spare_metrics = router.wait(&3, fixtures::timeout()).await?.metrics(|_| true, "snapshot of metrics").await?;
    assert_eq!(spare_metrics.last_log_index, 0, "a spare must not receive entries");

    tracing::info!("--- promoting server 3 to voter");
    router.assign_role(leader, 3, ServerRole::Voter).await?;
    want += 1;

    let all: BTreeSet<u64> = btreeset![0, 1, 2, 3];
    router.wait_for_log(&all, want, fixtures::timeout(), "promoted server caught up").await?;

    let metrics = router.wait(&leader, fixtures::timeout()).await?.log(want, "promotion committed").await?;
    assert_eq!(metrics.membership_config.server_role(3), Some(ServerRole::Voter));
    assert_eq!(metrics.membership_config.phase, ConfigurationPhase::Normal);

    router.assert_same_state_machines(&all).await;
    Ok(())
}

/// Removing a server excludes it from replication and quorum.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_remove_server() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let mut want = router.new_cluster(node_ids.clone()).await?;

    let leader = router.leader().await.expect("leader not found");
    let victim = *node_ids.iter().find(|id| **id != leader).unwrap();

    tracing::info!("--- removing server {}", victim);
    router.remove_server(leader, victim).await?;
    want += 1;

    let metrics = router.wait(&leader, fixtures::timeout()).await?.log(want, "removal committed").await?;
    assert!(!metrics.membership_config.contains(victim));
    assert_eq!(metrics.membership_config.voter_count(flexraft::Group::ANY), 2);

    // The remaining pair still commits writes.
    router.client_request_many(leader, "client", 10).await;
    want += 10;
    let rest: BTreeSet<u64> = node_ids.iter().copied().filter(|id| *id != victim).collect();
    router.wait_for_log(&rest, want, fixtures::timeout(), "writes after removal").await?;

    Ok(())
}

/// Config changes are rejected while another change is uncommitted or in catch-up.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_changes_are_serialized() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let want = router.new_cluster(node_ids.clone()).await?;
    let leader = router.leader().await.expect("leader not found");

    // A stale server id is rejected outright without mutating anything.
    let res = router.remove_server(leader, 99).await;
    assert!(matches!(
        res,
        Err(ResponseError::ChangeConfig(flexraft::ChangeConfigError::BadId(99)))
    ));

    // Re-assigning the same role is an error.
    let res = router.assign_role(leader, leader, ServerRole::Voter).await;
    assert!(matches!(
        res,
        Err(ResponseError::ChangeConfig(flexraft::ChangeConfigError::BadRole { .. }))
    ));

    let metrics = router.wait(&leader, fixtures::timeout()).await?.log(want, "no entries appended").await?;
    assert_eq!(metrics.last_log_index, want);
    Ok(())
}
