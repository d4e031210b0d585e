use chrono::{DateTime, Utc};

use super::types::{Candidate, MAX_BULK_BATCH, RetentionPolicy, snowflake_order};

/// Deletion work for one pass, split by the delete primitive the platform
/// accepts for each message.
///
/// `individual` holds messages at or past the bulk-delete age limit and
/// `bulk_batches` the younger ones in chunks of at most [`MAX_BULK_BATCH`].
/// Both are oldest first, and every individual message is older than every
/// bulk one, so draining `individual` before `bulk_batches` keeps the whole
/// pass oldest-first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    pub individual: Vec<Candidate>,
    pub bulk_batches: Vec<Vec<Candidate>>,
}

impl DeletionPlan {
    pub fn total(&self) -> usize {
        self.individual.len() + self.bulk_batches.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Every message in the order the pass deletes them.
    pub fn in_order(&self) -> impl Iterator<Item = &Candidate> {
        self.individual
            .iter()
            .chain(self.bulk_batches.iter().flatten())
    }
}

/// Messages the policy says must go, oldest first.
///
/// Pinned messages are removed first when the policy keeps them; the newest
/// `max_messages` of what is left survive.
pub fn select_for_deletion(
    mut candidates: Vec<Candidate>,
    policy: &RetentionPolicy,
) -> Vec<Candidate> {
    if policy.keep_pinned {
        candidates.retain(|candidate| !candidate.pinned);
    }
    candidates.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| snowflake_order(&a.message_id, &b.message_id))
    });

    let keep = usize::try_from(policy.max_messages).unwrap_or(usize::MAX);
    let excess = candidates.len().saturating_sub(keep);
    candidates.truncate(excess);
    candidates
}

/// Split an oldest-first deletion list by age relative to `now`.
pub fn partition(deletions: Vec<Candidate>, now: DateTime<Utc>) -> DeletionPlan {
    let (bulk, individual): (Vec<_>, Vec<_>) = deletions
        .into_iter()
        .partition(|candidate| candidate.is_bulk_eligible(now));

    let bulk_batches = bulk
        .chunks(MAX_BULK_BATCH)
        .map(<[Candidate]>::to_vec)
        .collect();

    DeletionPlan {
        individual,
        bulk_batches,
    }
}

/// Split an oldest-first bulk batch at `now` into the prefix that has aged
/// past the bulk-delete limit and the rest.
pub fn split_expired(batch: &[Candidate], now: DateTime<Utc>) -> (&[Candidate], &[Candidate]) {
    let expired = batch
        .iter()
        .take_while(|candidate| !candidate.is_bulk_eligible(now))
        .count();
    batch.split_at(expired)
}

/// [`select_for_deletion`] followed by [`partition`].
pub fn plan_deletions(
    candidates: Vec<Candidate>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> DeletionPlan {
    partition(select_for_deletion(candidates, policy), now)
}
