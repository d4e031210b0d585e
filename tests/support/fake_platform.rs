#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use servermaid::error::PlatformError;
use servermaid::retention::{
    Candidate, ChannelCountCache, ChatPlatform, EnforcerSettings, OperationKind,
    OperationRateLimiter, PlatformFuture, RateLimiterSettings, RetentionEnforcer,
    RetentionPolicy, RetentionServices,
};
use servermaid::store::{PolicyStore, StoreFuture};

pub const SERVER: &str = "900000000000000001";

/// Snowflake-like id; larger means newer.
pub fn message_id(n: u64) -> String {
    (1_000_000 + n).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteCall {
    Bulk(Vec<String>),
    Single(String),
}

#[derive(Default)]
struct FakeState {
    /// Oldest first.
    channels: HashMap<String, Vec<Candidate>>,
    fetch_failures: VecDeque<PlatformError>,
    delete_failures: VecDeque<PlatformError>,
    delete_calls: Vec<DeleteCall>,
    deleted: Vec<String>,
    fetch_calls: usize,
    next_id: u64,
}

/// In-memory chat platform with scriptable failures.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
    latency: Duration,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long first (use with paused time).
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Append a message `age` old. Returns its id.
    pub fn post(&self, channel_id: &str, age: TimeDelta, pinned: bool) -> Candidate {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let candidate = Candidate::new(message_id(state.next_id), Utc::now() - age, pinned);
        state
            .channels
            .entry(channel_id.to_string())
            .or_default()
            .push(candidate.clone());
        candidate
    }

    /// Append `n` recent messages, oldest first, one minute apart.
    pub fn post_many(&self, channel_id: &str, n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| {
                let minutes = i64::try_from(n - i).unwrap();
                self.post(channel_id, TimeDelta::minutes(minutes), false)
            })
            .collect()
    }

    pub fn remaining(&self, channel_id: &str) -> Vec<Candidate> {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remaining_ids(&self, channel_id: &str) -> Vec<String> {
        self.remaining(channel_id)
            .into_iter()
            .map(|c| c.message_id)
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().unwrap().fetch_calls
    }

    pub fn fail_next_fetch(&self, err: PlatformError) {
        self.state.lock().unwrap().fetch_failures.push_back(err);
    }

    pub fn fail_next_delete(&self, err: PlatformError) {
        self.state.lock().unwrap().delete_failures.push_back(err);
    }

    /// Simulate messages removed by someone else.
    pub fn remove_externally(&self, channel_id: &str, count: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(messages) = state.channels.get_mut(channel_id) {
            let count = count.min(messages.len());
            messages.drain(..count);
        }
    }

    fn remove_ids(state: &mut FakeState, channel_id: &str, ids: &[String]) {
        let wanted: HashSet<&String> = ids.iter().collect();
        if let Some(messages) = state.channels.get_mut(channel_id) {
            messages.retain(|m| !wanted.contains(&m.message_id));
        }
        state.deleted.extend(ids.iter().cloned());
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl ChatPlatform for FakePlatform {
    fn history_page<'a>(
        &'a self,
        channel_id: &'a str,
        before: Option<&'a str>,
        limit: u16,
    ) -> PlatformFuture<'a, Vec<Candidate>> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.lock().unwrap();
            state.fetch_calls += 1;
            if let Some(err) = state.fetch_failures.pop_front() {
                return Err(err);
            }
            let before: Option<u64> = before.map(|id| id.parse().unwrap());
            let page = state
                .channels
                .get(channel_id)
                .map(|messages| {
                    messages
                        .iter()
                        .rev()
                        .filter(|m| before.is_none_or(|b| m.message_id.parse::<u64>().unwrap() < b))
                        .take(usize::from(limit))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(page)
        })
    }

    fn delete_bulk<'a>(
        &'a self,
        channel_id: &'a str,
        message_ids: &'a [String],
    ) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.lock().unwrap();
            state.delete_calls.push(DeleteCall::Bulk(message_ids.to_vec()));
            if let Some(err) = state.delete_failures.pop_front() {
                return Err(err);
            }
            Self::remove_ids(&mut state, channel_id, message_ids);
            Ok(())
        })
    }

    fn delete_one<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
    ) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.lock().unwrap();
            state
                .delete_calls
                .push(DeleteCall::Single(message_id.to_string()));
            if let Some(err) = state.delete_failures.pop_front() {
                return Err(err);
            }
            Self::remove_ids(&mut state, channel_id, &[message_id.to_string()]);
            Ok(())
        })
    }
}

/// Policy store over a plain map.
#[derive(Default)]
pub struct MapPolicyStore {
    policies: Mutex<HashMap<(String, String), RetentionPolicy>>,
}

impl MapPolicyStore {
    pub fn with(policies: &[RetentionPolicy]) -> Self {
        let store = Self::default();
        {
            let mut map = store.policies.lock().unwrap();
            for policy in policies {
                map.insert(
                    (policy.server_id.clone(), policy.channel_id.clone()),
                    policy.clone(),
                );
            }
        }
        store
    }
}

fn ready<'a, T: Send + 'a>(value: T) -> StoreFuture<'a, T> {
    Box::pin(async move { Ok(value) })
}

impl PolicyStore for MapPolicyStore {
    fn name(&self) -> &str {
        "map"
    }

    fn get_policy<'a>(
        &'a self,
        server_id: &'a str,
        channel_id: &'a str,
    ) -> StoreFuture<'a, Option<RetentionPolicy>> {
        let key = (server_id.to_string(), channel_id.to_string());
        ready(self.policies.lock().unwrap().get(&key).cloned())
    }

    fn save_policy<'a>(&'a self, policy: &'a RetentionPolicy) -> StoreFuture<'a, ()> {
        self.policies.lock().unwrap().insert(
            (policy.server_id.clone(), policy.channel_id.clone()),
            policy.clone(),
        );
        ready(())
    }

    fn remove_policy<'a>(
        &'a self,
        server_id: &'a str,
        channel_id: &'a str,
    ) -> StoreFuture<'a, bool> {
        let key = (server_id.to_string(), channel_id.to_string());
        ready(self.policies.lock().unwrap().remove(&key).is_some())
    }

    fn list_policies<'a>(&'a self, server_id: &'a str) -> StoreFuture<'a, Vec<RetentionPolicy>> {
        let mut listed: Vec<RetentionPolicy> = self
            .policies
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.server_id == server_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        ready(listed)
    }
}

pub fn fast_limiter(kind: OperationKind) -> Arc<OperationRateLimiter> {
    Arc::new(OperationRateLimiter::new(
        kind,
        RateLimiterSettings {
            base_delay: Duration::from_millis(100),
            growth_factor: 2.0,
            max_backoff: Duration::from_secs(30),
            retry_buffer: Duration::from_secs(1),
        },
    ))
}

pub struct Harness {
    pub platform: Arc<FakePlatform>,
    pub policies: Arc<MapPolicyStore>,
    pub enforcer: Arc<RetentionEnforcer>,
}

impl Harness {
    pub fn new(platform: FakePlatform, policies: &[RetentionPolicy]) -> Self {
        Self::with_settings(platform, policies, EnforcerSettings::default())
    }

    pub fn with_settings(
        platform: FakePlatform,
        policies: &[RetentionPolicy],
        settings: EnforcerSettings,
    ) -> Self {
        let platform = Arc::new(platform);
        let policies = Arc::new(MapPolicyStore::with(policies));
        let services = RetentionServices {
            platform: Arc::clone(&platform) as Arc<dyn ChatPlatform>,
            policies: Arc::clone(&policies) as Arc<dyn PolicyStore>,
            counts: Arc::new(ChannelCountCache::new()),
            fetch_limiter: fast_limiter(OperationKind::Fetch),
            delete_limiter: fast_limiter(OperationKind::Delete),
        };
        Self {
            platform,
            policies,
            enforcer: Arc::new(RetentionEnforcer::new(services, settings)),
        }
    }

    pub fn counts(&self) -> &ChannelCountCache {
        &self.enforcer.services().counts
    }

    pub fn arrival(&self, channel_id: &str, pinned: bool) -> servermaid::retention::ArrivalEvent {
        let posted = self.platform.post(channel_id, TimeDelta::zero(), pinned);
        servermaid::retention::ArrivalEvent {
            server_id: SERVER.to_string(),
            channel_id: channel_id.to_string(),
            message_id: posted.message_id,
            created_at: posted.created_at,
            pinned,
        }
    }
}

pub fn policy(channel_id: &str, max_messages: u32, keep_pinned: bool) -> RetentionPolicy {
    RetentionPolicy::new(SERVER, channel_id, max_messages, keep_pinned).unwrap()
}

pub fn created_at_of(candidates: &[Candidate]) -> Vec<DateTime<Utc>> {
    candidates.iter().map(|c| c.created_at).collect()
}

pub fn forbidden() -> PlatformError {
    PlatformError::Forbidden("missing MANAGE_MESSAGES".into())
}

pub fn rate_limited(secs: u64) -> PlatformError {
    PlatformError::RateLimited {
        retry_after: Some(Duration::from_secs(secs)),
    }
}

pub fn transient() -> PlatformError {
    PlatformError::Transient("502 Bad Gateway".into())
}
