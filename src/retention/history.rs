use std::ops::ControlFlow;

use super::platform::ChatPlatform;
use super::rate_limiter::{OperationRateLimiter, run_throttled};
use super::types::{Candidate, HISTORY_PAGE_SIZE, RetentionPolicy, snowflake_order};
use crate::error::PlatformResult;

/// Most recent slice of a channel's history.
#[derive(Debug, Default)]
pub(crate) struct HistoryWindow {
    /// Delivery order, newest first.
    pub(crate) candidates: Vec<Candidate>,
    /// Stopped at the window cap; older messages were not read.
    pub(crate) truncated: bool,
}

/// Pages through channel history, one fetch-limiter slot per page.
pub(crate) struct HistoryReader<'a> {
    platform: &'a dyn ChatPlatform,
    limiter: &'a OperationRateLimiter,
}

impl<'a> HistoryReader<'a> {
    pub(crate) fn new(platform: &'a dyn ChatPlatform, limiter: &'a OperationRateLimiter) -> Self {
        Self { platform, limiter }
    }

    /// Recent history holding up to `window` messages that count against
    /// `policy`. Exempt pinned messages ride along without using up the
    /// window.
    pub(crate) async fn recent_counted(
        &self,
        channel_id: &str,
        policy: &RetentionPolicy,
        window: usize,
    ) -> PlatformResult<HistoryWindow> {
        let mut fetched = HistoryWindow::default();
        let mut counted = 0usize;
        self.walk(channel_id, |page| {
            for candidate in page {
                if counted == window {
                    fetched.truncated = true;
                    return ControlFlow::Break(());
                }
                if policy.counts(candidate.pinned) {
                    counted += 1;
                }
                fetched.candidates.push(candidate.clone());
            }
            ControlFlow::Continue(())
        })
        .await?;
        Ok(fetched)
    }

    /// Full scan: how many messages in the channel count against `policy`.
    pub(crate) async fn count_retained(
        &self,
        channel_id: &str,
        policy: &RetentionPolicy,
    ) -> PlatformResult<u64> {
        let mut count = 0u64;
        self.walk(channel_id, |page| {
            let counted = page.iter().filter(|c| policy.counts(c.pinned)).count();
            count += u64::try_from(counted).unwrap_or(u64::MAX);
            ControlFlow::Continue(())
        })
        .await?;
        Ok(count)
    }

    async fn walk<F>(&self, channel_id: &str, mut visit: F) -> PlatformResult<()>
    where
        F: FnMut(&[Candidate]) -> ControlFlow<()>,
    {
        let mut before: Option<String> = None;

        loop {
            let page = run_throttled(self.limiter, || {
                self.platform
                    .history_page(channel_id, before.as_deref(), HISTORY_PAGE_SIZE)
            })
            .await?;

            let Some(oldest) = page
                .iter()
                .min_by(|a, b| snowflake_order(&a.message_id, &b.message_id))
            else {
                return Ok(());
            };
            let next_before = oldest.message_id.clone();

            if visit(&page).is_break() || page.len() < usize::from(HISTORY_PAGE_SIZE) {
                return Ok(());
            }
            before = Some(next_before);
        }
    }
}
