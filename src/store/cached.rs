use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::traits::{PolicyStore, StoreFuture};
use crate::retention::RetentionPolicy;

type PolicyKey = (String, String);

struct CachedLookup {
    policy: Option<RetentionPolicy>,
    expires_at: Instant,
}

/// Read-through cache in front of another [`PolicyStore`].
///
/// Lookups are kept for `ttl`, including lookups that found nothing, so
/// unmanaged channels do not hit the database on every message. Writes go
/// through to the inner store and drop the cached key.
pub struct CachedPolicyStore<S> {
    inner: S,
    ttl: Duration,
    lookups: Mutex<HashMap<PolicyKey, CachedLookup>>,
}

impl<S: PolicyStore> CachedPolicyStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            lookups: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn cached(&self, key: &PolicyKey) -> Option<Option<RetentionPolicy>> {
        let mut lookups = self.lookups.lock().unwrap_or_else(PoisonError::into_inner);
        match lookups.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.policy.clone()),
            Some(_) => {
                lookups.remove(key);
                None
            }
            None => None,
        }
    }

    fn remember(&self, key: PolicyKey, policy: Option<RetentionPolicy>) {
        if self.ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + self.ttl;
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, CachedLookup { policy, expires_at });
    }

    fn forget(&self, server_id: &str, channel_id: &str) {
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(server_id.to_string(), channel_id.to_string()));
    }
}

impl<S: PolicyStore> PolicyStore for CachedPolicyStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_policy<'a>(
        &'a self,
        server_id: &'a str,
        channel_id: &'a str,
    ) -> StoreFuture<'a, Option<RetentionPolicy>> {
        Box::pin(async move {
            let key = (server_id.to_string(), channel_id.to_string());
            if let Some(hit) = self.cached(&key) {
                return Ok(hit);
            }
            let policy = self.inner.get_policy(server_id, channel_id).await?;
            self.remember(key, policy.clone());
            Ok(policy)
        })
    }

    fn save_policy<'a>(&'a self, policy: &'a RetentionPolicy) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.inner.save_policy(policy).await?;
            self.forget(&policy.server_id, &policy.channel_id);
            Ok(())
        })
    }

    fn remove_policy<'a>(
        &'a self,
        server_id: &'a str,
        channel_id: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let removed = self.inner.remove_policy(server_id, channel_id).await?;
            self.forget(server_id, channel_id);
            Ok(removed)
        })
    }

    fn list_policies<'a>(&'a self, server_id: &'a str) -> StoreFuture<'a, Vec<RetentionPolicy>> {
        self.inner.list_policies(server_id)
    }
}
