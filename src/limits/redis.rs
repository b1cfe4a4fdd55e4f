use async_trait::async_trait;

use super::{RateLimitDecision, RateLimiter, WindowPosition};
use crate::cache::key_fingerprint;
use crate::config::TierTable;
use crate::error::RateLimitError;
use crate::types::Tier;

// Window positions come from the Redis server clock so that instances with
// skewed clocks still agree on bucket boundaries. KEYS[1] is the key base;
// the bucket number is appended here.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local time = redis.call("TIME")
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local bucket = math.floor(now / window)
local elapsed = now - bucket * window

local cur_key = KEYS[1] .. ":" .. bucket
local prev_key = KEYS[1] .. ":" .. (bucket - 1)
local cur = tonumber(redis.call("GET", cur_key) or "0")
local prev = tonumber(redis.call("GET", prev_key) or "0")

-- reply: { allowed (1/0), current, previous, bucket, elapsed }
if limit == 0 then
  return { 0, cur, prev, bucket, elapsed }
end

local weighted = (cur + 1) * window + prev * (window - elapsed)
if weighted > limit * window then
  return { 0, cur, prev, bucket, elapsed }
end

redis.call("SET", cur_key, cur + 1, "PX", window * 2)
return { 1, cur + 1, prev, bucket, elapsed }
"#;

/// Shared limiter for horizontally scaled deployments. The check and the
/// increment run as one Lua script, so concurrent instances cannot both
/// take the last slot of a window.
#[derive(Clone, Debug)]
pub struct RedisRateLimiter {
    client: redis::Client,
    prefix: String,
    tiers: TierTable,
}

impl RedisRateLimiter {
    pub fn new(url: impl AsRef<str>, tiers: TierTable) -> Result<Self, RateLimitError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "pdf_meter".to_string(),
            tiers,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RateLimitError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Per-key base; the braces keep every bucket of one key in the same
    /// cluster slot.
    fn window_base(&self, fingerprint: &str, window_ms: u64) -> String {
        format!("{}:rate_limit:{{{fingerprint}}}:{window_ms}", self.prefix)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(
        &self,
        api_key: &str,
        tier: Tier,
        _now_ms: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let limits = self.tiers.get(tier);
        let Some(limit) = limits.requests_per_hour else {
            return Ok(RateLimitDecision::unlimited());
        };
        let window_ms = limits.window_seconds.max(1).saturating_mul(1000);
        let base = self.window_base(&key_fingerprint(api_key), window_ms);

        let mut conn = self.connection().await?;
        let reply: Vec<i64> = redis::Script::new(SLIDING_WINDOW_SCRIPT)
            .key(base)
            .arg(i64::from(limit))
            .arg(ms_to_i64(window_ms))
            .invoke_async(&mut conn)
            .await?;

        let [allowed, current, previous, bucket, elapsed] = reply.as_slice() else {
            return Err(RateLimitError::Backend(format!(
                "unexpected rate limit script reply: {reply:?}"
            )));
        };
        let position = WindowPosition {
            bucket: i64_to_u64(*bucket),
            elapsed_ms: i64_to_u64(*elapsed).min(window_ms - 1),
            window_ms,
        };
        let previous = if position.bucket == 0 { 0 } else { *previous };
        Ok(position.decide(
            limit,
            i64_to_u64(*current),
            i64_to_u64(previous),
            *allowed == 1,
        ))
    }
}

fn ms_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
