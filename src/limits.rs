//! Per-key request throughput, bucketed by tier.
//!
//! Both limiters use the same weighted two-bucket sliding window: the count
//! of the current fixed window plus the previous window's count scaled by the
//! share of it still inside the sliding window.

#[cfg(feature = "store-redis")]
pub mod redis;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{TierLimits, TierTable};
use crate::error::RateLimitError;
use crate::types::Tier;

#[cfg(feature = "store-redis")]
pub use self::redis::RedisRateLimiter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// `None` when the tier has no throughput limit.
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at_ms: Option<u64>,
}

impl RateLimitDecision {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            remaining: None,
            reset_at_ms: None,
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one request for `api_key` if it fits the tier's window.
    /// Refused requests are not counted. Shared backends may place the
    /// window by their own clock instead of `now_ms`.
    async fn allow(
        &self,
        api_key: &str,
        tier: Tier,
        now_ms: u64,
    ) -> Result<RateLimitDecision, RateLimitError>;
}

/// Position of `now_ms` in fixed windows of `window_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WindowPosition {
    pub bucket: u64,
    pub elapsed_ms: u64,
    pub window_ms: u64,
}

impl WindowPosition {
    pub(crate) fn at(limits: &TierLimits, now_ms: u64) -> Self {
        let window_ms = limits.window_seconds.max(1).saturating_mul(1000);
        Self {
            bucket: now_ms / window_ms,
            elapsed_ms: now_ms % window_ms,
            window_ms,
        }
    }

    pub(crate) fn reset_at_ms(&self) -> u64 {
        self.bucket.saturating_add(1).saturating_mul(self.window_ms)
    }

    /// Sliding-window count, rounded up.
    pub(crate) fn weighted(&self, current: u64, previous: u64) -> u64 {
        let window = u128::from(self.window_ms);
        let overlap = u128::from(self.window_ms - self.elapsed_ms);
        let scaled = u128::from(current) * window + u128::from(previous) * overlap;
        u64::try_from(scaled.div_ceil(window)).unwrap_or(u64::MAX)
    }

    pub(crate) fn decide(
        &self,
        limit: u32,
        current: u64,
        previous: u64,
        allowed: bool,
    ) -> RateLimitDecision {
        let used = self.weighted(current, previous);
        RateLimitDecision {
            allowed,
            limit: Some(limit),
            remaining: Some(u32::try_from(u64::from(limit).saturating_sub(used)).unwrap_or(0)),
            reset_at_ms: Some(self.reset_at_ms()),
        }
    }
}

#[derive(Debug, Clone)]
struct WindowUsage {
    bucket: u64,
    window_ms: u64,
    current: u64,
    previous: u64,
}

/// Process-local limiter. Counts are not shared between instances; use the
/// Redis limiter when the service runs more than one replica.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    tiers: TierTable,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Default)]
struct LimiterState {
    usage: HashMap<String, WindowUsage>,
    last_gc_ms: u64,
}

const GC_INTERVAL_MS: u64 = 60_000;

impl InMemoryRateLimiter {
    pub fn new(tiers: TierTable) -> Self {
        Self {
            tiers,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().usage.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_and_consume(&self, api_key: &str, tier: Tier, now_ms: u64) -> RateLimitDecision {
        let limits = self.tiers.get(tier);
        let mut state = self.lock();
        let Some(limit) = limits.requests_per_hour else {
            // Stop retaining window state for keys whose tier is unlimited.
            state.usage.remove(api_key);
            return RateLimitDecision::unlimited();
        };
        let position = WindowPosition::at(limits, now_ms);

        if now_ms.saturating_sub(state.last_gc_ms) >= GC_INTERVAL_MS {
            // Anything older than the previous window no longer contributes.
            state.usage.retain(|_, usage| {
                now_ms / usage.window_ms <= usage.bucket.saturating_add(1)
            });
            state.last_gc_ms = now_ms;
        }

        let usage = state
            .usage
            .entry(api_key.to_string())
            .or_insert(WindowUsage {
                bucket: position.bucket,
                window_ms: position.window_ms,
                current: 0,
                previous: 0,
            });
        if usage.window_ms != position.window_ms {
            *usage = WindowUsage {
                bucket: position.bucket,
                window_ms: position.window_ms,
                current: 0,
                previous: 0,
            };
        }
        if usage.bucket != position.bucket {
            usage.previous = if usage.bucket.saturating_add(1) == position.bucket {
                usage.current
            } else {
                0
            };
            usage.current = 0;
            usage.bucket = position.bucket;
        }

        let next = usage.current.saturating_add(1);
        let allowed = limit > 0 && position.weighted(next, usage.previous) <= u64::from(limit);
        if allowed {
            usage.current = next;
        }
        position.decide(limit, usage.current, usage.previous, allowed)
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(
        &self,
        api_key: &str,
        tier: Tier,
        now_ms: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Ok(self.check_and_consume(api_key, tier, now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(free_per_hour: u32) -> InMemoryRateLimiter {
        let mut tiers = TierTable::unlimited();
        tiers.free = TierLimits::new(Some(free_per_hour), None);
        InMemoryRateLimiter::new(tiers)
    }

    const HOUR_MS: u64 = 3_600_000;

    #[tokio::test]
    async fn refuses_once_window_is_full_and_reports_remaining() {
        let limiter = limiter(3);
        let now = 10 * HOUR_MS;

        let first = limiter.allow("k", Tier::Free, now).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, Some(2));
        assert_eq!(first.reset_at_ms, Some(11 * HOUR_MS));

        limiter.allow("k", Tier::Free, now).await.unwrap();
        let third = limiter.allow("k", Tier::Free, now).await.unwrap();
        assert!(third.allowed);
        assert_eq!(third.remaining, Some(0));

        let fourth = limiter.allow("k", Tier::Free, now).await.unwrap();
        assert!(!fourth.allowed);
        assert_eq!(fourth.remaining, Some(0));

        // Other keys have their own window.
        assert!(limiter.allow("other", Tier::Free, now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn previous_window_is_weighted_by_overlap() {
        let limiter = limiter(4);
        let start = 10 * HOUR_MS;
        for _ in 0..4 {
            assert!(limiter.allow("k", Tier::Free, start).await.unwrap().allowed);
        }

        // A quarter into the next window, 3/4 of the previous 4 still count.
        let quarter = 11 * HOUR_MS + HOUR_MS / 4;
        let decision = limiter.allow("k", Tier::Free, quarter).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(0));
        assert!(!limiter.allow("k", Tier::Free, quarter).await.unwrap().allowed);

        // Two windows later nothing carries over.
        let later = 13 * HOUR_MS;
        let decision = limiter.allow("k", Tier::Free, later).await.unwrap();
        assert_eq!(decision.remaining, Some(3));
    }

    #[tokio::test]
    async fn unlimited_tier_is_always_allowed() {
        let limiter = limiter(1);
        for _ in 0..10 {
            let decision = limiter.allow("k", Tier::Enterprise, 0).await.unwrap();
            assert_eq!(decision, RateLimitDecision::unlimited());
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn zero_limit_refuses_everything() {
        let limiter = limiter(0);
        assert!(!limiter.allow("k", Tier::Free, 0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn gc_drops_keys_idle_for_two_windows() {
        let limiter = limiter(10);
        limiter.allow("stale", Tier::Free, 0).await.unwrap();
        limiter.allow("fresh", Tier::Free, 2 * HOUR_MS).await.unwrap();
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn weighted_count_rounds_up() {
        let limits = TierLimits::new(Some(10), None);
        let position = WindowPosition::at(&limits, HOUR_MS / 2);
        assert_eq!(position.weighted(0, 1), 1);
        assert_eq!(position.weighted(2, 3), 4);
    }
}
