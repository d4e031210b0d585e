use std::future::Future;
use std::pin::Pin;

use crate::retention::RetentionPolicy;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Persisted per-channel retention settings.
pub trait PolicyStore: Send + Sync {
    fn name(&self) -> &str;

    fn get_policy<'a>(
        &'a self,
        server_id: &'a str,
        channel_id: &'a str,
    ) -> StoreFuture<'a, Option<RetentionPolicy>>;

    /// Insert or replace the policy for its channel.
    fn save_policy<'a>(&'a self, policy: &'a RetentionPolicy) -> StoreFuture<'a, ()>;

    /// Returns whether a policy existed.
    fn remove_policy<'a>(&'a self, server_id: &'a str, channel_id: &'a str)
    -> StoreFuture<'a, bool>;

    fn list_policies<'a>(&'a self, server_id: &'a str) -> StoreFuture<'a, Vec<RetentionPolicy>>;
}
