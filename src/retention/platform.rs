use std::future::Future;
use std::pin::Pin;

use super::types::Candidate;
use crate::error::PlatformResult;

pub type PlatformFuture<'a, T> = Pin<Box<dyn Future<Output = PlatformResult<T>> + Send + 'a>>;

/// Chat-platform operations the retention engine depends on.
///
/// Every call is a single request; throttling and retries belong to the
/// caller.
pub trait ChatPlatform: Send + Sync {
    /// One page of channel history, newest first, strictly older than
    /// `before` when given. A page shorter than `limit` ends the history.
    fn history_page<'a>(
        &'a self,
        channel_id: &'a str,
        before: Option<&'a str>,
        limit: u16,
    ) -> PlatformFuture<'a, Vec<Candidate>>;

    /// Delete up to [`MAX_BULK_BATCH`](super::MAX_BULK_BATCH) messages, all
    /// younger than the bulk-delete age limit.
    fn delete_bulk<'a>(
        &'a self,
        channel_id: &'a str,
        message_ids: &'a [String],
    ) -> PlatformFuture<'a, ()>;

    fn delete_one<'a>(&'a self, channel_id: &'a str, message_id: &'a str)
    -> PlatformFuture<'a, ()>;
}
