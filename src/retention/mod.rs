//! Retention enforcement engine: count cache, rate limiters, deletion
//! classifier and the orchestrating enforcer.

pub mod classifier;
pub mod count_cache;
pub mod enforcer;
pub(crate) mod history;
pub mod platform;
pub mod rate_limiter;
pub mod types;

pub use classifier::{
    DeletionPlan, partition, plan_deletions, select_for_deletion, split_expired,
};
pub use count_cache::{ChannelCountCache, CountCacheEntry};
pub use enforcer::{
    ArrivalConsumer, ArrivalFuture, EnforcerSettings, PassState, RetentionEnforcer,
    RetentionServices,
};
pub use platform::{ChatPlatform, PlatformFuture};
pub use rate_limiter::{OperationKind, OperationRateLimiter, RateLimiterSettings, run_throttled};
pub use types::{
    AbortReason, ArrivalEvent, BULK_DELETE_MAX_AGE, Candidate, DeletionOutcome, HISTORY_PAGE_SIZE,
    MAX_BULK_BATCH, RetentionPolicy,
};
