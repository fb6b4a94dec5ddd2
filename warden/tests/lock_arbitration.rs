use std::time::Duration;
use tokio::sync::mpsc;
use warden::{
    config::CellConfig,
    test_utils::test_cell,
    Error, LockMode,
};

fn lock_test_config(name: &str) -> CellConfig {
    // Long TTL keeps sessions out of jeopardy while the test focuses on
    // arbitration; fast sweeps keep grant latency low.
    CellConfig {
        sweep_interval_ms: 20,
        ..CellConfig::named(name)
    }
}

#[tokio::test]
async fn conflict_then_retry_bumps_sequencer() {
    // Scenario: S1 takes "L" exclusively, S2's non-blocking attempt is
    // refused, S1 releases, S2's retry is granted with the next sequencer.
    let (cell, _store) = test_cell(lock_test_config("arb-a")).await;
    let s1 = cell.open_session("alice", "alice-pw").await.unwrap();
    let s2 = cell.open_session("bob", "bob-pw").await.unwrap();

    let seq1 = cell
        .acquire_lock(s1.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();
    assert_eq!(seq1, 1);

    let err = cell
        .acquire_lock(s2.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModeConflict { .. }));

    cell.release_lock(s1.session, "L").await.unwrap();

    let seq2 = cell
        .acquire_lock(s2.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();
    assert_eq!(seq2, 2);
    assert_eq!(cell.current_sequencer("L").unwrap(), 2);
}

#[tokio::test]
async fn shared_holders_then_queued_exclusive() {
    // Scenario: two shared holders coexist; a blocking exclusive request
    // waits for both and is granted with exactly one sequencer bump.
    let (cell, _store) = test_cell(lock_test_config("arb-b")).await;
    let s1 = cell.open_session("alice", "alice-pw").await.unwrap();
    let s2 = cell.open_session("bob", "bob-pw").await.unwrap();
    let s3 = cell.open_session("carol", "carol-pw").await.unwrap();

    cell.acquire_lock(s1.session, "L", LockMode::Shared, false)
        .await
        .unwrap();
    cell.acquire_lock(s2.session, "L", LockMode::Shared, false)
        .await
        .unwrap();

    let info = cell.lock_info("L").unwrap();
    assert_eq!(info.holders.len(), 2);
    assert_eq!(info.sequencer, 0, "shared grants leave the sequencer alone");

    let waiter = {
        let cell = cell.clone();
        tokio::spawn(async move {
            cell.acquire_lock(s3.session, "L", LockMode::Exclusive, true)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cell.lock_info("L").unwrap().waiters, 1);

    cell.release_lock(s1.session, "L").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "one shared holder still present");

    cell.release_lock(s2.session, "L").await.unwrap();
    let seq = waiter.await.unwrap().unwrap();
    assert_eq!(seq, 1, "single bump for the exclusive transition");

    let info = cell.lock_info("L").unwrap();
    assert_eq!(info.holders, vec![s3.session]);
    assert_eq!(info.mode, Some(LockMode::Exclusive));
}

#[tokio::test]
async fn waiters_are_granted_fifo() {
    let (cell, _store) = test_cell(lock_test_config("arb-fifo")).await;
    let holder = cell.open_session("alice", "alice-pw").await.unwrap();
    cell.acquire_lock(holder.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();

    let (order_tx, mut order_rx) = mpsc::unbounded_channel();
    let mut waiters = Vec::new();
    for (i, (user, password)) in [("alice", "alice-pw"), ("bob", "bob-pw"), ("carol", "carol-pw")]
        .into_iter()
        .enumerate()
    {
        let opened = cell.open_session(user, password).await.unwrap();
        let cell = cell.clone();
        let order_tx = order_tx.clone();
        waiters.push(tokio::spawn(async move {
            let seq = cell
                .acquire_lock(opened.session, "L", LockMode::Exclusive, true)
                .await
                .unwrap();
            order_tx.send((i, seq)).unwrap();
            // Hand the lock onward so the next waiter can be observed.
            tokio::time::sleep(Duration::from_millis(30)).await;
            cell.release_lock(opened.session, "L").await.unwrap();
        }));
        // Strict arrival order needs deterministic queue entry.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    cell.release_lock(holder.session, "L").await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    drop(order_tx);

    let mut grants = Vec::new();
    while let Some(grant) = order_rx.recv().await {
        grants.push(grant);
    }
    assert_eq!(
        grants.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        vec![0, 1, 2],
        "grants must follow queue order"
    );
    let seqs: Vec<u64> = grants.iter().map(|(_, s)| *s).collect();
    assert_eq!(seqs, vec![2, 3, 4], "each exclusive grant bumps once");
}

#[tokio::test]
async fn shared_request_does_not_barge_past_queued_exclusive() {
    let (cell, _store) = test_cell(lock_test_config("arb-barge")).await;
    let s1 = cell.open_session("alice", "alice-pw").await.unwrap();
    let s2 = cell.open_session("bob", "bob-pw").await.unwrap();
    let s3 = cell.open_session("carol", "carol-pw").await.unwrap();

    cell.acquire_lock(s1.session, "L", LockMode::Shared, false)
        .await
        .unwrap();

    let exclusive_waiter = {
        let cell = cell.clone();
        tokio::spawn(async move {
            cell.acquire_lock(s2.session, "L", LockMode::Exclusive, true)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A shared request is compatible with the current holder but must not
    // be reordered ahead of the waiting exclusive.
    let err = cell
        .acquire_lock(s3.session, "L", LockMode::Shared, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModeConflict { .. }));

    cell.release_lock(s1.session, "L").await.unwrap();
    exclusive_waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn blocking_acquire_is_cancellable() {
    let (cell, _store) = test_cell(lock_test_config("arb-cancel")).await;
    let s1 = cell.open_session("alice", "alice-pw").await.unwrap();
    let s2 = cell.open_session("bob", "bob-pw").await.unwrap();

    cell.acquire_lock(s1.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();

    let waiter = {
        let cell = cell.clone();
        tokio::spawn(async move {
            cell.acquire_lock(s2.session, "L", LockMode::Exclusive, true)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cell.cancel_acquire(s2.session, "L").await.unwrap();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::AcquireCancelled { .. })));

    // The holder was never disturbed.
    let info = cell.lock_info("L").unwrap();
    assert_eq!(info.holders, vec![s1.session]);
    assert_eq!(info.waiters, 0);
}

#[tokio::test]
async fn self_upgrade_is_refused_not_deadlocked() {
    let (cell, _store) = test_cell(lock_test_config("arb-self")).await;
    let s1 = cell.open_session("alice", "alice-pw").await.unwrap();

    cell.acquire_lock(s1.session, "L", LockMode::Shared, false)
        .await
        .unwrap();

    // Even a blocking upgrade fails immediately instead of queueing
    // behind the session's own hold.
    let err = cell
        .acquire_lock(s1.session, "L", LockMode::Exclusive, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModeConflict { .. }));
}

#[tokio::test]
async fn conflict_counter_tracks_refusals() {
    let (cell, _store) = test_cell(lock_test_config("arb-conflicts")).await;
    let s1 = cell.open_session("alice", "alice-pw").await.unwrap();
    let s2 = cell.open_session("bob", "bob-pw").await.unwrap();

    cell.acquire_lock(s1.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();
    for _ in 0..3 {
        let _ = cell
            .acquire_lock(s2.session, "L", LockMode::Exclusive, false)
            .await;
    }
    assert_eq!(cell.lock_info("L").unwrap().conflicts, 3);
}

#[tokio::test]
async fn sequencer_query_on_unknown_lock_fails() {
    let (cell, _store) = test_cell(lock_test_config("arb-nosuch")).await;
    let err = cell.current_sequencer("never-acquired").unwrap_err();
    assert!(matches!(err, Error::NoSuchLock { .. }));
}

#[tokio::test]
async fn reacquire_same_mode_is_idempotent() {
    let (cell, _store) = test_cell(lock_test_config("arb-idem")).await;
    let s1 = cell.open_session("alice", "alice-pw").await.unwrap();

    let first = cell
        .acquire_lock(s1.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();
    let second = cell
        .acquire_lock(s1.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(cell.lock_info("L").unwrap().holders.len(), 1);
}

#[tokio::test]
async fn cells_do_not_share_lock_state() {
    let (cell_a, _store_a) = test_cell(lock_test_config("cell-a")).await;
    let (cell_b, _store_b) = test_cell(lock_test_config("cell-b")).await;

    let s_a = cell_a.open_session("alice", "alice-pw").await.unwrap();
    let s_b = cell_b.open_session("alice", "alice-pw").await.unwrap();

    let seq_a = cell_a
        .acquire_lock(s_a.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();
    let seq_b = cell_b
        .acquire_lock(s_b.session, "L", LockMode::Exclusive, false)
        .await
        .unwrap();
    assert_eq!(seq_a, 1);
    assert_eq!(seq_b, 1, "independent namespaces, independent sequencers");
    assert!(cell_b.release_lock(s_b.session, "L").await.is_ok());
    assert_eq!(cell_a.lock_info("L").unwrap().holders, vec![s_a.session]);
}
