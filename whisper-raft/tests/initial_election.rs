//! Cluster initial_election test.
//!
//! - brings three nodes online with the same config.
//! - asserts that exactly one leader emerges and every node agrees on the
//!   leader and its term.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use whisper_raft::State;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_election() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(3);
    let config = fixtures::test_config(300);
    for id in 0..3 {
        router.new_raft_node(id, config.clone()).await?;
    }

    let leader = router.wait_for_stable_leader(Duration::from_secs(10)).await?;

    let metrics = router.latest_metrics().await;
    let leaders: Vec<_> = metrics.iter().filter(|m| m.state == State::Leader).collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader: {:?}", metrics);
    assert_eq!(leaders[0].id, leader);
    assert!(leaders[0].current_term >= 1);
    for m in &metrics {
        assert_eq!(m.leader_id, Some(leader), "node {} disagrees on leader", m.id);
        assert_eq!(
            m.current_term, leaders[0].current_term,
            "node {} disagrees on term",
            m.id
        );
        if m.id != leader {
            assert_eq!(m.state, State::Follower);
        }
    }
    Ok(())
}

/// Two simultaneous candidates cannot both win: terms only move forward and
/// a single leader ends up on top even when the first wave splits.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_vote_converges() -> Result<()> {
    fixtures::init_tracing();

    // Four nodes, identical timeouts: a split first wave is likely; the
    // randomized next wave must still converge on one leader.
    let router = RaftRouter::new(4);
    let config = fixtures::test_config(250);
    for id in 0..4 {
        router.new_raft_node(id, config.clone()).await?;
    }

    let leader = router.wait_for_stable_leader(Duration::from_secs(15)).await?;

    // Terms never went backwards while settling.
    let metrics = router.latest_metrics().await;
    let leader_term = metrics.iter().find(|m| m.id == leader).unwrap().current_term;
    assert!(leader_term >= 1);
    for m in &metrics {
        assert!(m.current_term <= leader_term);
        assert!(m.commit_pos <= m.last_log_pos || m.commit_pos.is_null());
    }
    Ok(())
}
