//! Data model shared by the retention engine.

use std::fmt::Write as _;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Messages younger than this may be removed with a bulk-delete call.
/// Discord refuses bulk deletion of anything older.
pub const BULK_DELETE_MAX_AGE: TimeDelta = TimeDelta::days(14);

/// Maximum number of message ids in one bulk-delete request.
pub const MAX_BULK_BATCH: usize = 50;

/// Maximum page size for history retrieval.
pub const HISTORY_PAGE_SIZE: u16 = 100;

/// Per-channel retention rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub server_id: String,
    pub channel_id: String,
    pub max_messages: u32,
    pub keep_pinned: bool,
}

impl RetentionPolicy {
    pub fn new(
        server_id: impl Into<String>,
        channel_id: impl Into<String>,
        max_messages: u32,
        keep_pinned: bool,
    ) -> Result<Self, StoreError> {
        if max_messages == 0 {
            return Err(StoreError::InvalidPolicy(
                "max_messages must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            server_id: server_id.into(),
            channel_id: channel_id.into(),
            max_messages,
            keep_pinned,
        })
    }

    /// Whether a message with this pin state counts against the limit.
    pub fn counts(&self, pinned: bool) -> bool {
        !(self.keep_pinned && pinned)
    }
}

/// Read-only projection of a chat message taken from channel history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
}

impl Candidate {
    pub fn new(message_id: impl Into<String>, created_at: DateTime<Utc>, pinned: bool) -> Self {
        Self {
            message_id: message_id.into(),
            created_at,
            pinned,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.created_at
    }

    pub fn is_bulk_eligible(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < BULK_DELETE_MAX_AGE
    }
}

/// A new message observed in a guild channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalEvent {
    pub server_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
}

/// Why a pass stopped before working through its whole deletion list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The platform refused access to the channel.
    Forbidden,
    /// History could not be read, so nothing was classified.
    HistoryUnavailable,
}

/// Summary of one enforcement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionOutcome {
    pub deleted_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub aborted: Option<AbortReason>,
}

impl DeletionOutcome {
    pub fn aborted(reason: AbortReason) -> Self {
        Self {
            aborted: Some(reason),
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed_count == 0 && self.skipped_count == 0 && self.aborted.is_none()
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "deleted {}, failed {}",
            self.deleted_count, self.failed_count
        );
        if self.skipped_count > 0 {
            let _ = write!(text, ", skipped {}", self.skipped_count);
        }
        match self.aborted {
            Some(AbortReason::Forbidden) => text.push_str(" (missing permissions)"),
            Some(AbortReason::HistoryUnavailable) => text.push_str(" (history unavailable)"),
            None => {}
        }
        text
    }
}

/// Ordering key for platform message ids.
///
/// Snowflakes are decimal strings; numeric comparison is correct where
/// lexicographic comparison breaks across digit counts.
pub(crate) fn snowflake_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}
