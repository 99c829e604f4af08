//! Persistence across restarts.
//!
//! - a single-node cluster commits a write, then shuts down.
//! - restarted over the same directory it comes back with its term, tail,
//!   and commit position.
//! - with the state file gone but the log non-empty, the node refuses to
//!   come up.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use recordlog::LogPos;
use whisper_raft::SaveRequest;

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn restart_recovers_state() -> Result<()> {
    fixtures::init_tracing();

    let router = RaftRouter::new(1);
    router.new_raft_node(0, fixtures::test_config(200)).await?;
    router.wait_for_stable_leader(Duration::from_secs(5)).await?;

    let resp = router
        .save_direct(
            0,
            SaveRequest {
                data: b"durable".to_vec(),
                wait_to_commit: true,
            },
        )
        .await?;
    assert_eq!(resp.pos, Some(LogPos::new(0, 0, 0)));
    assert_eq!(resp.was_committed, Some(true));
    let term_before = resp.term;

    let dir = router.shutdown_node(0).await?;

    // Same directory, fresh node: everything is remembered.
    router
        .new_raft_node_with_dir(0, dir.clone(), fixtures::test_config(60_000))
        .await?;
    let raft = router.get_raft(0).await?;
    let metrics = raft
        .wait(Some(Duration::from_secs(2)))
        .metrics(move |m| m.current_term >= term_before, "restart state loaded")
        .await?;
    assert_eq!(metrics.last_log_pos, LogPos::new(0, 0, 0));
    assert_eq!(metrics.commit_pos, LogPos::new(0, 0, 0));

    let entries = router.read_entries(0).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data, b"durable".to_vec());

    // Losing the state file while the log has data is a refusal to serve.
    let dir = router.shutdown_node(0).await?;
    std::fs::remove_file(dir.path().join("_raft_state_n0"))?;
    let result = router
        .new_raft_node_with_dir(0, dir, fixtures::test_config(60_000))
        .await;
    assert!(result.is_err(), "node must refuse to serve without its state");
    Ok(())
}
