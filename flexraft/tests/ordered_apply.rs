use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use flexraft::Config;
use flexraft::RaftStorageDebug;
use maplit::btreeset;

use fixtures::RaftRouter;

mod fixtures;

/// Total ordering of applies under load with network jitter.
///
/// What does this test do?
///
/// - brings a 3 voter cluster online with randomized send delays, so AppendEntries and
///   their responses interleave out of order.
/// - writes 200 commands through the leader, each waiting for its apply result.
/// - asserts that every state machine applied the same sequence (serials are strictly
///   increasing per client in the memstore, so reordering would corrupt the recorded
///   responses).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_apply_under_jitter() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::builder(config.clone()).send_delay(5).build());

    let node_ids: BTreeSet<u64> = btreeset![0, 1, 2];
    let mut want = router.new_cluster(node_ids.clone()).await?;

    let leader = router.leader().await.expect("leader not found");

    tracing::info!("--- writing 200 commands");
    router.client_request_many(leader, "client", 200).await;
    want += 200;

    router.wait_for_log(&node_ids, want, fixtures::timeout(), "all applied").await?;
    router.assert_same_state_machines(&node_ids).await;

    // The recorded status must reflect the last write, proving in-order apply.
    let sto = router.get_storage_handle(&leader).await?;
    let sm = sto.get_state_machine().await;
    assert_eq!(sm.client_status.get("client"), Some(&"request-199".to_string()));
    assert_eq!(sm.client_serial_responses.get("client").map(|(serial, _)| *serial), Some(199));

    Ok(())
}
