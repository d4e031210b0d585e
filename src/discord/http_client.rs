use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Method, Response, StatusCode, header::HeaderMap};
use serde::Deserialize;
use serde_json::json;
use tokio::{sync::Mutex, time::sleep};

use super::types::{API_BASE, snowflake_timestamp};
use crate::error::{PlatformError, PlatformResult};
use crate::retention::{Candidate, ChatPlatform, PlatformFuture};

#[derive(Debug, Clone)]
struct RateLimitBucket {
    remaining: u32,
    reset_at: f64,
}

/// Subset of a Discord message object the retention engine reads.
#[derive(Debug, Deserialize)]
struct MessageSummary {
    id: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    pinned: bool,
}

impl MessageSummary {
    fn into_candidate(self) -> Option<Candidate> {
        let created_at = self
            .timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .or_else(|| snowflake_timestamp(&self.id))?;
        Some(Candidate::new(self.id, created_at, self.pinned))
    }
}

/// Discord REST client.
///
/// Waits out known-exhausted buckets before sending, but never retries a 429
/// itself: rate limits surface as [`PlatformError::RateLimited`] so the
/// caller's limiter can back off.
pub struct DiscordHttpClient {
    client: reqwest::Client,
    bot_token: String,
    api_base: String,
    buckets: Arc<Mutex<HashMap<String, RateLimitBucket>>>,
    global_reset_at: Arc<Mutex<Option<f64>>>,
}

impl DiscordHttpClient {
    #[must_use]
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_api_base(bot_token, API_BASE)
    }

    #[must_use]
    pub fn with_api_base(bot_token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            buckets: Arc::new(Mutex::new(HashMap::new())),
            global_reset_at: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get_current_user(&self) -> Result<serde_json::Value> {
        let url = format!("{}/users/@me", self.api_base);
        let response = self
            .request(Method::GET, &url, None)
            .await
            .context("fetch current Discord user")?;
        response
            .json()
            .await
            .context("parse current Discord user JSON")
    }

    pub async fn get_gateway_bot(&self) -> Result<serde_json::Value> {
        let url = format!("{}/gateway/bot", self.api_base);
        let response = self
            .request(Method::GET, &url, None)
            .await
            .context("fetch Discord gateway bot data")?;
        response
            .json()
            .await
            .context("parse Discord gateway bot JSON")
    }

    /// One page of history, newest first.
    pub async fn fetch_messages(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: u16,
    ) -> PlatformResult<Vec<Candidate>> {
        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        let limit = limit.clamp(1, 100).to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(before) = before {
            query.push(("before", before));
        }

        let route_key = Self::bucket_key_from_url(&url);
        self.wait_for_limits(&route_key).await;
        let response = self
            .client
            .get(&url)
            .query(&query)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await
            .map_err(|e| PlatformError::Transient(format!("GET {url}: {e}")))?;
        let response = self.check_response(&route_key, response, false).await?;

        let messages: Vec<MessageSummary> = response
            .json()
            .await
            .map_err(|e| PlatformError::Transient(format!("parse message history: {e}")))?;
        Ok(messages
            .into_iter()
            .filter_map(|message| {
                let id = message.id.clone();
                let candidate = message.into_candidate();
                if candidate.is_none() {
                    tracing::warn!(
                        channel_id,
                        message_id = id.as_str(),
                        "message without usable timestamp"
                    );
                }
                candidate
            })
            .collect())
    }

    /// Delete one message. A message that is already gone counts as deleted.
    pub async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> PlatformResult<()> {
        let url = format!("{}/channels/{channel_id}/messages/{message_id}", self.api_base);
        self.call(Method::DELETE, &url, None, true).await
    }

    /// Post a plain-text message.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> PlatformResult<()> {
        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        let body = json!({ "content": content });
        self.call(Method::POST, &url, Some(body), false).await
    }

    /// Bulk delete. Discord requires 2..=100 ids; a single id goes through
    /// the single-message endpoint instead.
    pub async fn bulk_delete_messages(
        &self,
        channel_id: &str,
        message_ids: &[String],
    ) -> PlatformResult<()> {
        match message_ids {
            [] => Ok(()),
            [only] => self.delete_message(channel_id, only).await,
            _ => {
                let url = format!("{}/channels/{channel_id}/messages/bulk-delete", self.api_base);
                let body = json!({ "messages": message_ids });
                self.call(Method::POST, &url, Some(body), false).await
            }
        }
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
        missing_is_ok: bool,
    ) -> PlatformResult<()> {
        let route_key = Self::bucket_key_from_url(url);
        self.wait_for_limits(&route_key).await;

        let mut request_builder = self
            .client
            .request(method.clone(), url)
            .header("Authorization", format!("Bot {}", self.bot_token));
        if let Some(payload) = body {
            request_builder = request_builder.json(&payload);
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| PlatformError::Transient(format!("{} {url}: {e}", method.as_str())))?;
        self.check_response(&route_key, response, missing_is_ok)
            .await
            .map(|_| ())
    }

    /// Record bucket headers and map the status onto [`PlatformError`].
    async fn check_response(
        &self,
        route_key: &str,
        response: Response,
        missing_is_ok: bool,
    ) -> PlatformResult<Response> {
        self.update_bucket_from_headers(route_key, response.headers())
            .await;

        let status = response.status();
        if status.is_success() || (missing_is_ok && status == StatusCode::NOT_FOUND) {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let is_global = Self::is_global_limit(response.headers());
            let header_hint = Self::parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let retry_after = header_hint.or_else(|| Self::parse_retry_after_body(&body));
            if let Some(retry_after) = retry_after {
                self.record_429(is_global, retry_after, route_key).await;
            }
            tracing::debug!(route_key, ?retry_after, is_global, "Discord rate limited");
            return Err(PlatformError::RateLimited { retry_after });
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|error| format!("<failed to read response body: {error}>"));
        Err(classify_status(status, &body))
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let route_key = Self::bucket_key_from_url(url);
        self.wait_for_limits(&route_key).await;

        let mut request_builder = self
            .client
            .request(method.clone(), url)
            .header("Authorization", format!("Bot {}", self.bot_token));
        if let Some(payload) = body {
            request_builder = request_builder.json(&payload);
        }

        let response = request_builder
            .send()
            .await
            .with_context(|| format!("send Discord request {} {}", method.as_str(), url))?;
        self.check_response(&route_key, response, false)
            .await
            .map_err(|e| anyhow::anyhow!("Discord request {} {url} failed: {e}", method.as_str()))
    }

    fn parse_header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u32>().ok())
    }

    fn parse_header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<f64>().ok())
    }

    fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
        let seconds = Self::parse_header_f64(headers, "Retry-After")?;
        Some(seconds_to_duration(seconds))
    }

    fn parse_retry_after_body(body: &str) -> Option<Duration> {
        let payload: serde_json::Value = serde_json::from_str(body).ok()?;
        let seconds = payload.get("retry_after")?.as_f64()?;
        Some(seconds_to_duration(seconds))
    }

    fn is_global_limit(headers: &HeaderMap) -> bool {
        headers
            .get("X-RateLimit-Global")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    fn now_unix_timestamp() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn bucket_key_from_url(url: &str) -> String {
        let path = reqwest::Url::parse(url)
            .map_or_else(|_| url.to_string(), |parsed| parsed.path().to_string());
        let path_without_api_prefix = path
            .strip_prefix("/api/v10")
            .map_or(path.as_str(), |stripped| stripped);

        let normalized = path_without_api_prefix
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                if segment.chars().all(|character| character.is_ascii_digit()) {
                    "{id}".to_string()
                } else {
                    segment.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("/");

        format!("/{normalized}")
    }

    async fn wait_for_limits(&self, route_key: &str) {
        let now = Self::now_unix_timestamp();
        let global_wait = {
            let global_guard = self.global_reset_at.lock().await;
            global_guard.and_then(|reset_at| (reset_at > now).then_some(reset_at - now))
        };
        if let Some(wait_secs) = global_wait {
            sleep(Duration::from_secs_f64(wait_secs)).await;
        }

        let route_wait = {
            let buckets = self.buckets.lock().await;
            buckets.get(route_key).and_then(|bucket| {
                if bucket.remaining == 0 && bucket.reset_at > now {
                    Some(bucket.reset_at - now)
                } else {
                    None
                }
            })
        };
        if let Some(wait_secs) = route_wait {
            tracing::debug!(route_key, wait_secs, "Discord bucket exhausted; waiting for reset");
            sleep(Duration::from_secs_f64(wait_secs)).await;
        }
    }

    async fn record_429(&self, is_global: bool, retry_after: Duration, route_key: &str) {
        let reset_at = Self::now_unix_timestamp() + retry_after.as_secs_f64();
        if is_global {
            *self.global_reset_at.lock().await = Some(reset_at);
        } else {
            self.buckets.lock().await.insert(
                route_key.to_string(),
                RateLimitBucket {
                    remaining: 0,
                    reset_at,
                },
            );
        }
    }

    async fn update_bucket_from_headers(&self, route_key: &str, headers: &HeaderMap) {
        let remaining = Self::parse_header_u32(headers, "X-RateLimit-Remaining");
        let reset_at = Self::parse_header_f64(headers, "X-RateLimit-Reset");

        if let (Some(remaining), Some(reset_at)) = (remaining, reset_at) {
            let mut buckets = self.buckets.lock().await;
            buckets.insert(
                route_key.to_string(),
                RateLimitBucket {
                    remaining,
                    reset_at,
                },
            );
        }
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

fn classify_status(status: StatusCode, body: &str) -> PlatformError {
    let detail = format!("{status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Forbidden(detail),
        _ => PlatformError::Transient(detail),
    }
}

impl ChatPlatform for DiscordHttpClient {
    fn history_page<'a>(
        &'a self,
        channel_id: &'a str,
        before: Option<&'a str>,
        limit: u16,
    ) -> PlatformFuture<'a, Vec<Candidate>> {
        Box::pin(self.fetch_messages(channel_id, before, limit))
    }

    fn delete_bulk<'a>(
        &'a self,
        channel_id: &'a str,
        message_ids: &'a [String],
    ) -> PlatformFuture<'a, ()> {
        Box::pin(self.bulk_delete_messages(channel_id, message_ids))
    }

    fn delete_one<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
    ) -> PlatformFuture<'a, ()> {
        Box::pin(self.delete_message(channel_id, message_id))
    }
}
