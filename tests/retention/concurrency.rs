use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::join_all;

use super::fake_platform::{FakePlatform, Harness, policy};

const LATENCY: Duration = Duration::from_millis(20);

fn ids_of(candidates: &[servermaid::retention::Candidate]) -> Vec<String> {
    candidates.iter().map(|c| c.message_id.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_arrivals_never_delete_a_message_twice() {
    let harness = Harness::new(FakePlatform::with_latency(LATENCY), &[policy("300", 3, false)]);
    let posted = harness.platform.post_many("300", 3);

    let events: Vec<_> = (0..5).map(|_| harness.arrival("300", false)).collect();
    let outcomes = join_all(
        events
            .iter()
            .map(|event| harness.enforcer.handle_arrival(event)),
    )
    .await;

    let deleted_total: usize = outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap().unwrap().deleted_count)
        .sum();
    assert_eq!(deleted_total, 5);

    let deleted = harness.platform.deleted();
    let unique: HashSet<&String> = deleted.iter().collect();
    assert_eq!(unique.len(), deleted.len());

    // Across all queued passes the five oldest went, in age order.
    let mut expected = ids_of(&posted);
    expected.extend(events[..2].iter().map(|e| e.message_id.clone()));
    assert_eq!(deleted, expected);
    assert_eq!(
        harness.platform.remaining_ids("300"),
        events[2..]
            .iter()
            .map(|e| e.message_id.clone())
            .collect::<Vec<_>>()
    );
}

#[tokio::test(start_paused = true)]
async fn burst_behind_a_cached_count_still_deletes_oldest_first() {
    let harness = Harness::new(FakePlatform::with_latency(LATENCY), &[policy("310", 10, false)]);
    let primed = harness.platform.post_many("310", 10);
    let under_limit = harness.enforcer.enforce(&policy("310", 10, false)).await;
    assert_eq!(under_limit.deleted_count, 0);
    assert_eq!(harness.counts().entry("310").unwrap().count, 10);

    // Four messages land before any of their passes runs.
    let events: Vec<_> = (0..4).map(|_| harness.arrival("310", false)).collect();
    let first = harness
        .enforcer
        .handle_arrival(&events[0])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.deleted_count, 4);
    assert_eq!(harness.platform.deleted(), ids_of(&primed[..4]));

    for event in &events[1..] {
        let outcome = harness
            .enforcer
            .handle_arrival(event)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.deleted_count, 0);
    }
    let mut expected_remaining = ids_of(&primed[4..]);
    expected_remaining.extend(events.iter().map(|e| e.message_id.clone()));
    assert_eq!(harness.platform.remaining_ids("310"), expected_remaining);
}

#[tokio::test(start_paused = true)]
async fn channels_are_enforced_independently() {
    let harness = Harness::new(
        FakePlatform::with_latency(LATENCY),
        &[policy("400", 2, false), policy("401", 5, true)],
    );
    harness.platform.post_many("400", 12);
    harness.platform.post_many("401", 9);

    let tight = policy("400", 2, false);
    let loose = policy("401", 5, true);
    let (left, right) = tokio::join!(
        harness.enforcer.enforce(&tight),
        harness.enforcer.enforce(&loose),
    );

    assert_eq!(left.deleted_count, 10);
    assert_eq!(right.deleted_count, 4);
    assert_eq!(harness.platform.remaining("400").len(), 2);
    assert_eq!(harness.platform.remaining("401").len(), 5);
    assert_eq!(harness.counts().entry("400").unwrap().count, 2);
    assert_eq!(harness.counts().entry("401").unwrap().count, 5);
}

#[tokio::test(start_paused = true)]
async fn pass_locks_are_dropped_for_forgotten_channels() {
    let harness = Harness::new(FakePlatform::new(), &[policy("500", 2, false)]);
    harness.platform.post_many("500", 4);
    harness.enforcer.enforce(&policy("500", 2, false)).await;
    assert_eq!(harness.enforcer.tracked_channels(), 1);

    harness.enforcer.forget_channel("500");

    assert_eq!(harness.enforcer.tracked_channels(), 0);
    assert_eq!(harness.counts().pending_fills(), 0);
}
