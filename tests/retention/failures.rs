use std::time::Duration;

use chrono::TimeDelta;
use tokio::time::Instant;

use servermaid::retention::AbortReason;

use super::fake_platform::{
    DeleteCall, FakePlatform, Harness, forbidden, policy, rate_limited, transient,
};

const CHANNEL: &str = "200";

#[tokio::test(start_paused = true)]
async fn rate_limited_delete_waits_for_hint_then_retries_once() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 1, false)]);
    harness.platform.post_many(CHANNEL, 3);
    harness.platform.fail_next_delete(rate_limited(8));

    let started = Instant::now();
    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;

    assert_eq!(outcome.deleted_count, 2);
    assert!(outcome.is_clean());
    // Hint of 8s plus the 1s buffer.
    assert!(started.elapsed() >= Duration::from_secs(9));

    let calls = harness.platform.delete_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);

    let limiter = &harness.enforcer.services().delete_limiter;
    assert_eq!(limiter.current_delay(), limiter.settings().base_delay);
}

#[tokio::test(start_paused = true)]
async fn second_rate_limit_fails_the_unit_without_aborting() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 1, false)]);
    harness.platform.post_many(CHANNEL, 3);
    harness.platform.fail_next_delete(rate_limited(1));
    harness.platform.fail_next_delete(rate_limited(1));

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;

    assert_eq!(outcome.deleted_count, 0);
    assert_eq!(outcome.failed_count, 2);
    assert_eq!(outcome.aborted, None);
    assert_eq!(harness.platform.delete_calls().len(), 2);
    assert_eq!(
        harness.enforcer.services().delete_limiter.current_delay(),
        Duration::from_secs(2)
    );
    assert_eq!(harness.platform.remaining(CHANNEL).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn forbidden_delete_aborts_and_skips_remaining_units() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 1, false)]);
    for days in [30, 25, 20] {
        harness
            .platform
            .post(CHANNEL, TimeDelta::days(days), false);
    }
    harness.platform.post_many(CHANNEL, 2);
    harness.platform.fail_next_delete(forbidden());

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;

    assert_eq!(outcome.aborted, Some(AbortReason::Forbidden));
    assert_eq!(outcome.deleted_count, 0);
    assert_eq!(outcome.failed_count, 1);
    assert_eq!(outcome.skipped_count, 3);
    assert_eq!(harness.platform.delete_calls().len(), 1);
    assert!(outcome.summary().contains("missing permissions"));
}

#[tokio::test(start_paused = true)]
async fn forbidden_history_aborts_before_any_delete() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 1, false)]);
    harness.platform.post_many(CHANNEL, 5);
    harness.platform.fail_next_fetch(forbidden());

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;

    assert_eq!(outcome.aborted, Some(AbortReason::Forbidden));
    assert!(harness.platform.delete_calls().is_empty());
    assert!(harness.counts().entry(CHANNEL).is_none());
}

#[tokio::test(start_paused = true)]
async fn unreadable_history_reports_history_unavailable() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 1, false)]);
    harness.platform.post_many(CHANNEL, 5);
    harness.platform.fail_next_fetch(transient());

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;

    assert_eq!(outcome.aborted, Some(AbortReason::HistoryUnavailable));
    assert!(harness.platform.delete_calls().is_empty());

    // The next pass reads history again and catches up.
    let retry = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;
    assert_eq!(retry.deleted_count, 4);
}

#[tokio::test(start_paused = true)]
async fn transient_delete_failure_only_fails_that_unit() {
    let harness = Harness::new(FakePlatform::new(), &[policy(CHANNEL, 1, false)]);
    let old = harness
        .platform
        .post(CHANNEL, TimeDelta::days(20), false);
    let next_old = harness
        .platform
        .post(CHANNEL, TimeDelta::days(19), false);
    harness.platform.post_many(CHANNEL, 3);
    harness.platform.fail_next_delete(transient());

    let outcome = harness.enforcer.enforce(&policy(CHANNEL, 1, false)).await;

    assert_eq!(outcome.failed_count, 1);
    assert_eq!(outcome.deleted_count, 3);
    assert_eq!(outcome.skipped_count, 0);
    assert_eq!(outcome.aborted, None);

    let calls = harness.platform.delete_calls();
    assert_eq!(calls[0], DeleteCall::Single(old.message_id.clone()));
    assert_eq!(calls[1], DeleteCall::Single(next_old.message_id));
    assert!(harness.platform.remaining_ids(CHANNEL).contains(&old.message_id));

    // The failed message is still there, and reconcile counted it.
    assert_eq!(harness.counts().entry(CHANNEL).unwrap().count, 2);
    assert_eq!(
        harness.enforcer.services().delete_limiter.consecutive_failures(),
        0
    );
}
