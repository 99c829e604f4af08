//! Cluster client_writes test.
//!
//! - elects a known leader (n0 gets the shortest election timeout).
//! - a committed write lands at (0,0,0) in term 1 and reaches every node.
//! - a Save at a follower redirects with the leader's name.
//! - the retrying client follows the redirect and writes at (0,0,1).

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use recordlog::LogPos;
use whisper_raft::ClientConfig;
use whisper_raft::RaftClient;
use whisper_raft::SaveRequest;
use whisper_raft::State;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_writes() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(3);
    // n0 times out first and wins term 1.
    router.new_raft_node(0, fixtures::test_config(150)).await?;
    router.new_raft_node(1, fixtures::test_config(400)).await?;
    router.new_raft_node(2, fixtures::test_config(1200)).await?;

    let leader = router.wait_for_stable_leader(Duration::from_secs(10)).await?;
    assert_eq!(leader, 0, "n0 should win the first election");
    let wait0 = router.wait(0, Some(Duration::from_secs(5))).await?;
    let metrics = wait0.state(State::Leader, "n0 -> leader").await?;
    assert_eq!(metrics.current_term, 1);

    // An isolated committed write.
    let client_config = ClientConfig::build()
        .request_timeout_ms(5000)
        .reopen_connection_interval_ms(50)
        .validate()?;
    let client = RaftClient::new(client_config, router.peers(), router.clone());

    let response = client.send_data_committed(b"x".to_vec()).await?;
    assert_eq!(response.term, 1);
    assert_eq!(response.pos, Some(LogPos::new(0, 0, 0)));
    assert_eq!(response.was_committed, Some(true));

    // Every node ends up with the same entry at (0,0,0) and commits it.
    for id in 0..3 {
        let wait = router.wait(id, Some(Duration::from_secs(5))).await?;
        wait.commit_at_least(LogPos::new(0, 0, 0), format!("n{} commit x", id)).await?;
        let entries = router.read_entries(id).await?;
        assert_eq!(entries.len(), 1, "node {} log: {:?}", id, entries);
        assert_eq!(entries[0].pos, LogPos::new(0, 0, 0));
        assert_eq!(entries[0].term, 1);
        assert_eq!(entries[0].last_log_pos, LogPos::null());
        assert_eq!(entries[0].last_log_term, 0);
        assert_eq!(entries[0].data, b"x".to_vec());
    }

    // A follower redirects, naming the leader.
    let redirect = router
        .save_direct(
            2,
            SaveRequest {
                data: b"z".to_vec(),
                wait_to_commit: false,
            },
        )
        .await?;
    assert_eq!(redirect.pos, None);
    assert_eq!(redirect.was_committed, Some(false));
    assert_eq!(redirect.leader_name.as_deref(), Some("n0"));

    // The client follows the hint and lands the next position.
    let response = client.send_data(b"z".to_vec()).await?;
    assert_eq!(response.term, 1);
    assert_eq!(response.pos, Some(LogPos::new(0, 0, 1)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_cluster_commits_immediately() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(1);
    router.new_raft_node(0, fixtures::test_config(200)).await?;
    router.wait_for_stable_leader(Duration::from_secs(5)).await?;

    let client = RaftClient::new(
        ClientConfig::default(),
        router.peers(),
        Arc::clone(&router),
    );
    let response = client.send_data_committed(b"solo".to_vec()).await?;
    assert_eq!(response.pos, Some(LogPos::new(0, 0, 0)));
    assert_eq!(response.was_committed, Some(true));
    Ok(())
}
