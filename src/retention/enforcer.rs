use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::classifier::{DeletionPlan, plan_deletions, split_expired};
use super::count_cache::ChannelCountCache;
use super::history::HistoryReader;
use super::platform::ChatPlatform;
use super::rate_limiter::{OperationRateLimiter, run_throttled};
use super::types::{AbortReason, ArrivalEvent, Candidate, DeletionOutcome, RetentionPolicy};
use crate::error::PlatformError;
use crate::store::PolicyStore;

/// Stages of one enforcement pass, used as a log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Counting,
    Fetching,
    Classifying,
    Deleting,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnforcerSettings {
    /// Upper bound on counted messages read per pass. Exempt pinned
    /// messages do not use it up.
    pub history_window: usize,
}

impl Default for EnforcerSettings {
    fn default() -> Self {
        Self {
            history_window: 5_000,
        }
    }
}

/// Shared services an enforcer drives. Constructed once at startup.
#[derive(Clone)]
pub struct RetentionServices {
    pub platform: Arc<dyn ChatPlatform>,
    pub policies: Arc<dyn PolicyStore>,
    pub counts: Arc<ChannelCountCache>,
    pub fetch_limiter: Arc<OperationRateLimiter>,
    pub delete_limiter: Arc<OperationRateLimiter>,
}

/// Orchestrates enforcement passes.
///
/// Passes for one channel are mutually exclusive; passes for different
/// channels run concurrently and meet only at the two rate limiters.
pub struct RetentionEnforcer {
    services: RetentionServices,
    settings: EnforcerSettings,
    pass_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

enum DeleteUnit<'a> {
    Single(&'a Candidate),
    Batch(&'a [Candidate]),
}

impl DeleteUnit<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(batch) => batch.len(),
        }
    }
}

impl RetentionEnforcer {
    pub fn new(services: RetentionServices, settings: EnforcerSettings) -> Self {
        Self {
            services,
            settings,
            pass_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &RetentionServices {
        &self.services
    }

    /// React to a new message. `None` when the channel has no policy.
    pub async fn handle_arrival(
        &self,
        event: &ArrivalEvent,
    ) -> anyhow::Result<Option<DeletionOutcome>> {
        let Some(policy) = self
            .services
            .policies
            .get_policy(&event.server_id, &event.channel_id)
            .await?
        else {
            return Ok(None);
        };

        let _pass = self.lock_channel(&policy.channel_id).await;
        Ok(Some(self.run_pass(&policy, Some(event)).await))
    }

    /// Administrative trigger after a policy was created or changed: the
    /// cached count no longer matches the policy, so it is rebuilt.
    pub async fn reconfigure(&self, policy: &RetentionPolicy) -> DeletionOutcome {
        let _pass = self.lock_channel(&policy.channel_id).await;
        self.services.counts.invalidate(&policy.channel_id);
        self.run_pass(policy, None).await
    }

    /// Run a pass without an arrival.
    pub async fn enforce(&self, policy: &RetentionPolicy) -> DeletionOutcome {
        let _pass = self.lock_channel(&policy.channel_id).await;
        self.run_pass(policy, None).await
    }

    /// Drop everything cached for a channel that is no longer managed.
    pub fn forget_channel(&self, channel_id: &str) {
        self.services.counts.invalidate(channel_id);
        let mut locks = self.lock_pass_locks();
        if locks
            .get(channel_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(channel_id);
        }
    }

    /// Channels with a pass lock allocated.
    pub fn tracked_channels(&self) -> usize {
        self.lock_pass_locks().len()
    }

    async fn run_pass(
        &self,
        policy: &RetentionPolicy,
        arrival: Option<&ArrivalEvent>,
    ) -> DeletionOutcome {
        let pass_id = Uuid::new_v4();
        let channel_id = policy.channel_id.as_str();
        let reader = HistoryReader::new(
            self.services.platform.as_ref(),
            &self.services.fetch_limiter,
        );

        tracing::debug!(
            %pass_id,
            channel_id,
            state = ?PassState::Counting,
            "retention pass"
        );
        if let Some(event) = arrival
            && policy.counts(event.pinned)
        {
            self.services.counts.increment_count(channel_id);
        }
        let count = match self
            .services
            .counts
            .get_count(channel_id, || reader.count_retained(channel_id, policy))
            .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(
                    %pass_id,
                    channel_id,
                    error = %err,
                    "could not count channel history"
                );
                return DeletionOutcome::aborted(abort_reason(&err));
            }
        };

        if count <= u64::from(policy.max_messages) {
            tracing::debug!(
                %pass_id,
                channel_id,
                count,
                max = policy.max_messages,
                "under limit"
            );
            return DeletionOutcome::default();
        }

        tracing::debug!(
            %pass_id,
            channel_id,
            count,
            state = ?PassState::Fetching,
            "retention pass"
        );
        let window = match reader
            .recent_counted(channel_id, policy, self.settings.history_window)
            .await
        {
            Ok(window) => window,
            Err(err) => {
                tracing::warn!(
                    %pass_id,
                    channel_id,
                    error = %err,
                    "could not fetch channel history"
                );
                self.services.counts.invalidate(channel_id);
                return DeletionOutcome::aborted(abort_reason(&err));
            }
        };
        if window.truncated {
            tracing::warn!(
                %pass_id,
                channel_id,
                history_window = self.settings.history_window,
                "history window reached; older messages are not considered"
            );
        }

        tracing::debug!(
            %pass_id,
            channel_id,
            fetched = window.candidates.len(),
            state = ?PassState::Classifying,
            "retention pass"
        );
        let plan = plan_deletions(window.candidates, policy, Utc::now());

        tracing::debug!(
            %pass_id,
            channel_id,
            individual = plan.individual.len(),
            batches = plan.bulk_batches.len(),
            state = ?PassState::Deleting,
            "retention pass"
        );
        let outcome = self.execute(channel_id, &plan).await;

        tracing::debug!(%pass_id, channel_id, state = ?PassState::Reconciling, "retention pass");
        self.reconcile(&reader, policy).await;

        tracing::info!(
            %pass_id,
            channel_id,
            deleted = outcome.deleted_count,
            failed = outcome.failed_count,
            skipped = outcome.skipped_count,
            aborted = ?outcome.aborted,
            "retention pass complete"
        );
        outcome
    }

    async fn execute(&self, channel_id: &str, plan: &DeletionPlan) -> DeletionOutcome {
        let total = plan.total();
        let mut outcome = DeletionOutcome::default();

        'units: {
            for candidate in &plan.individual {
                let unit = DeleteUnit::Single(candidate);
                if self.apply(channel_id, &unit, &mut outcome).await.is_break() {
                    break 'units;
                }
            }
            for batch in &plan.bulk_batches {
                // Backoff can push the oldest of a batch past the bulk age limit.
                let (expired, fresh) = split_expired(batch, Utc::now());
                let units = expired
                    .iter()
                    .map(DeleteUnit::Single)
                    .chain((!fresh.is_empty()).then_some(DeleteUnit::Batch(fresh)));
                for unit in units {
                    if self.apply(channel_id, &unit, &mut outcome).await.is_break() {
                        break 'units;
                    }
                }
            }
        }

        outcome.skipped_count = total - outcome.deleted_count - outcome.failed_count;
        outcome
    }

    async fn apply(
        &self,
        channel_id: &str,
        unit: &DeleteUnit<'_>,
        outcome: &mut DeletionOutcome,
    ) -> ControlFlow<()> {
        match self.delete_unit(channel_id, unit).await {
            Ok(()) => outcome.deleted_count += unit.len(),
            Err(PlatformError::Forbidden(reason)) => {
                tracing::warn!(
                    channel_id,
                    reason = reason.as_str(),
                    "delete forbidden; aborting pass"
                );
                outcome.failed_count += unit.len();
                outcome.aborted = Some(AbortReason::Forbidden);
                return ControlFlow::Break(());
            }
            Err(err) => {
                tracing::warn!(
                    channel_id,
                    messages = unit.len(),
                    error = %err,
                    "delete failed"
                );
                outcome.failed_count += unit.len();
            }
        }
        ControlFlow::Continue(())
    }

    async fn delete_unit(
        &self,
        channel_id: &str,
        unit: &DeleteUnit<'_>,
    ) -> Result<(), PlatformError> {
        let platform = self.services.platform.as_ref();
        let limiter = &self.services.delete_limiter;
        match unit {
            DeleteUnit::Single(candidate) => {
                run_throttled(limiter, || {
                    platform.delete_one(channel_id, &candidate.message_id)
                })
                .await
            }
            DeleteUnit::Batch(batch) => {
                let ids: Vec<String> = batch.iter().map(|c| c.message_id.clone()).collect();
                run_throttled(limiter, || platform.delete_bulk(channel_id, &ids)).await
            }
        }
    }

    async fn reconcile(&self, reader: &HistoryReader<'_>, policy: &RetentionPolicy) {
        let channel_id = policy.channel_id.as_str();
        match reader.count_retained(channel_id, policy).await {
            Ok(count) => self.services.counts.set_count(channel_id, count),
            Err(err) => {
                tracing::warn!(channel_id, error = %err, "recount failed; dropping cached count");
                self.services.counts.invalidate(channel_id);
            }
        }
    }

    async fn lock_channel(&self, channel_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.lock_pass_locks()
                .entry(channel_id.to_string())
                .or_default(),
        );
        lock.lock_owned().await
    }

    fn lock_pass_locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.pass_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn abort_reason(err: &PlatformError) -> AbortReason {
    if err.is_forbidden() {
        AbortReason::Forbidden
    } else {
        AbortReason::HistoryUnavailable
    }
}

pub type ArrivalFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Consumer side of the arrival event stream.
pub trait ArrivalConsumer: Send + Sync {
    fn on_arrival<'a>(&'a self, event: ArrivalEvent) -> ArrivalFuture<'a>;
}

impl ArrivalConsumer for RetentionEnforcer {
    fn on_arrival<'a>(&'a self, event: ArrivalEvent) -> ArrivalFuture<'a> {
        Box::pin(async move {
            match self.handle_arrival(&event).await {
                Ok(Some(outcome)) if outcome.deleted_count > 0 || !outcome.is_clean() => {
                    tracing::info!(
                        server_id = event.server_id.as_str(),
                        channel_id = event.channel_id.as_str(),
                        "retention enforced: {}",
                        outcome.summary()
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        server_id = event.server_id.as_str(),
                        channel_id = event.channel_id.as_str(),
                        "policy lookup failed: {err:#}"
                    );
                }
            }
        })
    }
}
