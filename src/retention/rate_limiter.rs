use std::fmt;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until};

use crate::config::RateLimitConfig;
use crate::error::{PlatformError, PlatformResult};

/// Which kind of platform traffic a limiter throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Fetch,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetch"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterSettings {
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub max_backoff: Duration,
    /// Added on top of an upstream `retry_after` hint.
    pub retry_buffer: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            growth_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            retry_buffer: Duration::from_secs(1),
        }
    }
}

impl From<&RateLimitConfig> for RateLimiterSettings {
    fn from(config: &RateLimitConfig) -> Self {
        let base_delay = Duration::from_millis(config.base_delay_ms);
        Self {
            base_delay,
            growth_factor: config.growth_factor.max(1.0),
            max_backoff: Duration::from_secs_f64(config.max_backoff_secs.max(0.0)).max(base_delay),
            retry_buffer: Duration::from_secs_f64(config.retry_buffer_secs.max(0.0)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimiterState {
    current_delay: Duration,
    last_request_at: Option<Instant>,
    consecutive_failures: u32,
}

/// Serializing throttle for one kind of platform operation.
///
/// Every caller of [`acquire`](Self::acquire) waits until `current_delay` has
/// passed since the previous caller was released. Callers queue behind an
/// async mutex, so the limiter is a single FIFO per instance shared by every
/// channel in the process.
pub struct OperationRateLimiter {
    kind: OperationKind,
    settings: RateLimiterSettings,
    queue: tokio::sync::Mutex<()>,
    state: Mutex<RateLimiterState>,
}

impl OperationRateLimiter {
    pub fn new(kind: OperationKind, settings: RateLimiterSettings) -> Self {
        Self {
            kind,
            settings,
            queue: tokio::sync::Mutex::new(()),
            state: Mutex::new(RateLimiterState {
                current_delay: settings.base_delay,
                last_request_at: None,
                consecutive_failures: 0,
            }),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn settings(&self) -> &RateLimiterSettings {
        &self.settings
    }

    pub fn current_delay(&self) -> Duration {
        self.lock_state().current_delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock_state().consecutive_failures
    }

    /// Wait for this caller's turn.
    ///
    /// The deadline is re-read after every sleep, so a backoff raised while a
    /// caller is parked extends that caller's wait.
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        loop {
            let ready_at = {
                let state = self.lock_state();
                state
                    .last_request_at
                    .map(|last| last + state.current_delay)
            };
            match ready_at {
                Some(deadline) if deadline > Instant::now() => sleep_until(deadline).await,
                _ => break,
            }
        }
        self.lock_state().last_request_at = Some(Instant::now());
    }

    /// Grow the delay after a failed call.
    ///
    /// An upstream hint wins over the heuristic; the delay never shrinks here.
    pub fn increase_backoff(&self, retry_after: Option<Duration>) {
        let mut state = self.lock_state();
        let proposed = match retry_after {
            Some(hint) => (hint + self.settings.retry_buffer).min(self.settings.max_backoff),
            None => {
                let delay = self.exponential_delay(state.consecutive_failures);
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                delay
            }
        };
        state.current_delay = state.current_delay.max(proposed);
        tracing::debug!(
            kind = %self.kind,
            delay_ms = duration_ms(state.current_delay),
            failures = state.consecutive_failures,
            "rate limiter backoff increased"
        );
    }

    pub fn reset_backoff(&self) {
        let mut state = self.lock_state();
        state.current_delay = self.settings.base_delay;
        state.consecutive_failures = 0;
    }

    fn exponential_delay(&self, failures: u32) -> Duration {
        let max_secs = self.settings.max_backoff.as_secs_f64();
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let growth = self.settings.growth_factor.powi(exponent);
        let secs = self.settings.base_delay.as_secs_f64() * growth;
        if secs.is_finite() && secs < max_secs {
            Duration::from_secs_f64(secs)
        } else {
            self.settings.max_backoff
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RateLimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one platform call through `limiter`, retrying once on a rate limit.
///
/// On `RateLimited` the limiter backs off, the caller sleeps the hinted
/// duration plus the buffer, and the call is issued a second time. Transient
/// failures back off heuristically and are returned without a retry.
/// `Forbidden` is returned untouched.
pub async fn run_throttled<T, F, Fut>(
    limiter: &OperationRateLimiter,
    mut call: F,
) -> PlatformResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PlatformResult<T>>,
{
    limiter.acquire().await;
    match call().await {
        Ok(value) => {
            limiter.reset_backoff();
            Ok(value)
        }
        Err(PlatformError::RateLimited { retry_after }) => {
            tracing::warn!(
                kind = %limiter.kind(),
                retry_after_ms = retry_after.map(duration_ms),
                "rate limited; retrying once"
            );
            limiter.increase_backoff(retry_after);
            if let Some(wait) = retry_after {
                sleep(wait + limiter.settings().retry_buffer).await;
            }
            limiter.acquire().await;
            match call().await {
                Ok(value) => {
                    limiter.reset_backoff();
                    Ok(value)
                }
                Err(err) => {
                    note_failure(limiter, &err);
                    Err(err)
                }
            }
        }
        Err(err) => {
            note_failure(limiter, &err);
            Err(err)
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn note_failure(limiter: &OperationRateLimiter, err: &PlatformError) {
    match err {
        PlatformError::RateLimited { retry_after } => limiter.increase_backoff(*retry_after),
        PlatformError::Transient(_) => limiter.increase_backoff(None),
        PlatformError::Forbidden(_) => {}
    }
}
