use chrono::TimeDelta;

use servermaid::retention::DeletionOutcome;

use super::fake_platform::{DeleteCall, FakePlatform, Harness, policy};

const CHANNEL: &str = "100";

#[tokio::test(start_paused = true)]
async fn arrival_in_unmanaged_channel_is_ignored() {
    let harness = Harness::new(FakePlatform::new(), &[]);
    harness.platform.post_many(CHANNEL, 10);

    let event = harness.arrival(CHANNEL, false);
    let outcome = harness.enforcer.handle_arrival(&event).await.unwrap();

    assert!(outcome.is_none());
    assert_eq!(harness.platform.fetch_calls(), 0);
    assert!(harness.platform.deleted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn arrival_over_limit_deletes_oldest_excess() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 3, false)]);
    let posted = harness.platform.post_many(CHANNEL, 5);

    let event = harness.arrival(CHANNEL, false);
    let outcome = harness
        .enforcer
        .handle_arrival(&event)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.deleted_count, 3);
    assert!(outcome.is_clean());

    let expected: Vec<String> = posted[..3].iter().map(|c| c.message_id.clone()).collect();
    assert_eq!(harness.platform.deleted(), expected);

    let remaining = harness.platform.remaining_ids(CHANNEL);
    assert_eq!(remaining.len(), 3);
    assert_eq!(remaining.last(), Some(&event.message_id));
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 3);
}

#[tokio::test(start_paused = true)]
async fn under_limit_deletes_nothing() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 10, false)]);
    harness.platform.post_many(CHANNEL, 4);

    let event = harness.arrival(CHANNEL, false);
    let outcome = harness
        .enforcer
        .handle_arrival(&event)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome, DeletionOutcome::default());
    assert!(harness.platform.delete_calls().is_empty());
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 5);
}

#[tokio::test(start_paused = true)]
async fn cached_count_avoids_rescanning_history() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 10, false)]);
    harness.platform.post_many(CHANNEL, 2);

    let first = harness.arrival(CHANNEL, false);
    harness.enforcer.handle_arrival(&first).await.unwrap();
    let scans = harness.platform.fetch_calls();

    let second = harness.arrival(CHANNEL, false);
    harness.enforcer.handle_arrival(&second).await.unwrap();

    assert_eq!(harness.platform.fetch_calls(), scans);
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 4);
}

#[tokio::test(start_paused = true)]
async fn keep_pinned_never_deletes_pinned_messages() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 2, true)]);
    let pinned = harness
        .platform
        .post(CHANNEL, TimeDelta::hours(3), true);
    harness.platform.post_many(CHANNEL, 4);

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 2, true)).await;

    assert_eq!(outcome.deleted_count, 2);
    let remaining = harness.platform.remaining(CHANNEL);
    assert_eq!(remaining.len(), 3);
    assert!(remaining.iter().any(|c| c.message_id == pinned.message_id));
    assert!(!harness.platform.deleted().contains(&pinned.message_id));
    // Pinned messages do not count against the limit.
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 2);
}

#[tokio::test(start_paused = true)]
async fn pinned_arrival_does_not_count_when_kept() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 2, true)]);
    harness.platform.post_many(CHANNEL, 2);
    harness.enforcer.enforce(&policy(CHANNEL, 2, true)).await;

    let event = harness.arrival(CHANNEL, true);
    let outcome = harness
        .enforcer
        .handle_arrival(&event)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.deleted_count, 0);
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 2);
}

#[tokio::test(start_paused = true)]
async fn pinned_messages_are_ordinary_without_keep_pinned() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 2, false)]);
    let pinned = harness
        .platform
        .post(CHANNEL, TimeDelta::hours(3), true);
    harness.platform.post_many(CHANNEL, 2);

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 2, false)).await;

    assert_eq!(outcome.deleted_count, 1);
    assert_eq!(harness.platform.deleted(), vec![pinned.message_id]);
}

#[tokio::test(start_paused = true)]
async fn pins_outnumbering_the_limit_do_not_hide_older_messages() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 5, true)]);
    let old: Vec<_> = (0..10)
        .map(|i| {
            harness
                .platform
                .post(CHANNEL, TimeDelta::hours(5) - TimeDelta::minutes(i), false)
        })
        .collect();
    for i in 0..60 {
        harness
            .platform
            .post(CHANNEL, TimeDelta::minutes(120 - i), true);
    }

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 5, true)).await;

    assert_eq!(outcome.deleted_count, 5);
    let expected: Vec<String> = old[..5].iter().map(|c| c.message_id.clone()).collect();
    assert_eq!(harness.platform.deleted(), expected);
    let remaining = harness.platform.remaining(CHANNEL);
    assert_eq!(remaining.iter().filter(|c| c.pinned).count(), 60);
    assert_eq!(remaining.iter().filter(|c| !c.pinned).count(), 5);
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 5);

    let again = harness.enforcer.enforce(&policy(CHANNEL, 5, true)).await;
    assert_eq!(again.deleted_count, 0);
}

#[tokio::test(start_paused = true)]
async fn arrival_after_a_burst_removes_the_oldest_first() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 3, false)]);
    let primed = harness.platform.post_many(CHANNEL, 3);
    harness.enforcer.enforce(&policy(CHANNEL, 3, false)).await;

    let first = harness.arrival(CHANNEL, false);
    let second = harness.arrival(CHANNEL, false);
    let outcome = harness
        .enforcer
        .handle_arrival(&first)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.deleted_count, 2);
    assert_eq!(
        harness.platform.deleted(),
        vec![primed[0].message_id.clone(), primed[1].message_id.clone()]
    );
    assert_eq!(
        harness.platform.remaining_ids(CHANNEL),
        vec![
            primed[2].message_id.clone(),
            first.message_id.clone(),
            second.message_id
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn old_messages_are_deleted_one_by_one_before_bulk_batches() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 1, false)]);
    let old_a = harness.platform.post(CHANNEL, TimeDelta::days(20), false);
    let old_b = harness.platform.post(CHANNEL, TimeDelta::days(15), false);
    let young_a = harness.platform.post(CHANNEL, TimeDelta::days(2), false);
    let young_b = harness.platform.post(CHANNEL, TimeDelta::hours(1), false);
    harness.platform.post(CHANNEL, TimeDelta::minutes(1), false);

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;

    assert_eq!(outcome.deleted_count, 4);
    assert_eq!(
        harness.platform.delete_calls(),
        vec![
            DeleteCall::Single(old_a.message_id),
            DeleteCall::Single(old_b.message_id),
            DeleteCall::Bulk(vec![young_a.message_id, young_b.message_id]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn large_backlog_is_deleted_in_batches_of_fifty() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 10, false)]);
    harness.platform.post_many(CHANNEL, 130);

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 10, false)).await;

    assert_eq!(outcome.deleted_count, 120);
    let sizes: Vec<usize> = harness
        .platform
        .delete_calls()
        .into_iter()
        .map(|call| match call {
            DeleteCall::Bulk(ids) => ids.len(),
            DeleteCall::Single(_) => 1,
        })
        .collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    assert_eq!(harness.platform.remaining(CHANNEL).len(), 10);
}

#[tokio::test(start_paused = true)]
async fn repeated_pass_is_a_no_op() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 3, false)]);
    harness.platform.post_many(CHANNEL, 8);

    let first = harness.enforcer.enforce(&policy(CHANNEL, 3, false)).await;
    let calls = harness.platform.delete_calls().len();
    let second = harness.enforcer.enforce(&policy(CHANNEL, 3, false)).await;

    assert_eq!(first.deleted_count, 5);
    assert_eq!(second, DeletionOutcome::default());
    assert_eq!(harness.platform.delete_calls().len(), calls);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_recounts_under_the_new_policy() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 10, true)]);
    harness.platform.post(CHANNEL, TimeDelta::hours(2), true);
    harness.platform.post_many(CHANNEL, 4);
    harness.enforcer.enforce(&policy(CHANNEL, 10, true)).await;
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 4);

    // Switching off keep_pinned makes the pinned message count again.
    let outcome = harness
        .enforcer
        .reconfigure(&policy(CHANNEL, 3, false))
        .await;

    assert_eq!(outcome.deleted_count, 2);
    assert_eq!(harness.platform.remaining(CHANNEL).len(), 3);
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 3);
}

#[tokio::test(start_paused = true)]
async fn reconcile_repairs_a_drifted_count() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 10, false)]);
    harness.platform.post_many(CHANNEL, 5);
    harness.counts().set_count(CHANNEL, 40);

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 10, false)).await;

    assert_eq!(outcome.deleted_count, 0);
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 5);
}

#[tokio::test(start_paused = true)]
async fn externally_removed_messages_are_picked_up_by_reconcile() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 4, false)]);
    harness.platform.post_many(CHANNEL, 6);
    harness.enforcer.enforce(&policy(CHANNEL, 4, false)).await;
    harness.platform.remove_externally(CHANNEL, 3);

    // Cached count still says 4; the arrival pushes it to 5 and the pass
    // finds nothing to delete, then corrects the cache.
    let event = harness.arrival(CHANNEL, false);
    let outcome = harness
        .enforcer
        .handle_arrival(&event)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.deleted_count, 0);
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 2);
}

#[tokio::test(start_paused = true)]
async fn forget_channel_drops_the_cached_count() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 4, false)]);
    harness.platform.post_many(CHANNEL, 2);
    harness.enforcer.enforce(&policy(CHANNEL, 4, false)).await;
    assert!(harness.counts().entry(CHANNEL).is_some());

    harness.enforcer.forget_channel(CHANNEL);

    assert!(harness.counts().entry(CHANNEL).is_none());
}
