//! Replay-guard compliance: every accepted signal_id is unique among
//! non-expired records, concurrent submissions race to exactly one winner,
//! and a misconfigured KV mirror never rejects a legitimate signal.

use std::sync::Arc;
use vega_execution_rs::replay_guard::ReplayGuard;

#[tokio::test]
async fn test_at_most_once_within_ttl() {
    let guard = ReplayGuard::new(60_000, None);

    assert!(!guard.seen_before("sig-1", 1_000));
    for t in (1_001..10_000).step_by(997) {
        assert!(guard.seen_before("sig-1", t));
    }
}

#[tokio::test]
async fn test_expired_id_reusable_after_ttl() {
    let guard = ReplayGuard::new(1_000, None);

    assert!(!guard.seen_before("sig-1", 0));
    assert!(guard.seen_before("sig-1", 1_000));
    // One past the TTL window the record has expired.
    assert!(!guard.seen_before("sig-1", 2_001));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_duplicates_admit_exactly_one() {
    let guard = ReplayGuard::new(60_000, None);

    let mut handles = Vec::new();
    for _ in 0..32 {
        let guard: Arc<ReplayGuard> = guard.clone();
        handles.push(tokio::spawn(async move {
            !guard.seen_before("contested-id", 1_000)
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one submission may win the test-and-set");
}

#[tokio::test]
async fn test_unreachable_mirror_never_rejects() {
    // Nothing listens on this port; the mirror degrades silently.
    let guard = ReplayGuard::new(60_000, Some("redis://127.0.0.1:59999/"));

    assert!(!guard.seen_before("sig-1", 1_000));
    assert!(!guard.seen_before("sig-2", 1_000));
    assert!(guard.seen_before("sig-1", 2_000));
}

#[tokio::test]
async fn test_distinct_ids_never_collide() {
    let guard = ReplayGuard::new(60_000, None);
    for i in 0..1_000 {
        assert!(!guard.seen_before(&format!("sig-{}", i), 1_000));
    }
    assert_eq!(guard.len(), 1_000);
}

#[tokio::test]
async fn test_random_interleaving_preserves_at_most_once() {
    use rand::seq::SliceRandom;

    let guard = ReplayGuard::new(60_000, None);
    let mut submissions: Vec<usize> = (0..100).flat_map(|i| [i, i, i]).collect();
    submissions.shuffle(&mut rand::thread_rng());

    let mut accepted = vec![0u32; 100];
    for id in submissions {
        if !guard.seen_before(&format!("sig-{}", id), 1_000) {
            accepted[id] += 1;
        }
    }
    assert!(accepted.iter().all(|&n| n == 1));
}
