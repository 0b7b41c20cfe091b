//! Shared rate-limit backend on Redis.
//!
//! Each bucket is a hash (`tokens`, `ts`) updated atomically by a Lua script,
//! next to a sorted set of recent admissions that caps every rolling window
//! at `capacity + burst`.
//! Time comes from the Redis server clock so all gateway instances agree on
//! refill. Buckets expire once they would have refilled completely.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{BackendError, Decision, RateLimitBackend};
use super::quota::TierQuota;

/// Default key namespace.
pub const DEFAULT_KEY_PREFIX: &str = "gateway:rl";

/// Token bucket refill and take, capped by a rolling-window admission log.
///
/// KEYS[1] bucket hash, KEYS[2] admission log (sorted set scored by ms).
/// ARGV: max tokens, ms per token, cost, window ms.
/// Returns `{allowed, remaining, retry_after_ms, reset_ms}`.
const TOKEN_BUCKET_LUA: &str = r#"
local max_tokens = tonumber(ARGV[1])
local interval_ms = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local window_ms = tonumber(ARGV[4])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now - window_ms)
local used = redis.call('ZCARD', KEYS[2])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = max_tokens
  ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(max_tokens, tokens + elapsed / interval_ms)

local allowed = 0
local retry_after = 0
if tokens >= cost and used + cost <= max_tokens then
  tokens = tokens - cost
  allowed = 1
  local seq = redis.call('HINCRBY', KEYS[1], 'seq', cost)
  for i = 1, cost do
    redis.call('ZADD', KEYS[2], now, tostring(now) .. ':' .. tostring(seq - i))
  end
  used = used + cost
else
  if tokens < cost then
    retry_after = math.ceil((cost - tokens) * interval_ms)
  end
  if used + cost > max_tokens then
    if cost > max_tokens then
      retry_after = math.max(retry_after, window_ms)
    else
      local nth = used + cost - max_tokens - 1
      local oldest = redis.call('ZRANGE', KEYS[2], nth, nth, 'WITHSCORES')
      if oldest[2] then
        retry_after = math.max(retry_after, tonumber(oldest[2]) + window_ms - now)
      end
    end
  end
end

local remaining = math.max(0, math.min(math.floor(tokens), max_tokens - used))
local reset = math.ceil((max_tokens - tokens) * interval_ms)
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now)
redis.call('PEXPIRE', KEYS[1], math.max(reset, interval_ms, window_ms) + 1000)
redis.call('PEXPIRE', KEYS[2], window_ms + 1000)

return {allowed, remaining, retry_after, reset}
"#;

/// Redis-backed token buckets shared by every gateway instance.
///
/// The connection is opened on first use. `ConnectionManager` reconnects on
/// its own afterwards, so a Redis outage at startup does not stop the gateway.
pub struct RedisBackend {
    client: Client,
    manager: OnceCell<ConnectionManager>,
    script: Script,
    key_prefix: String,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.manager.initialized())
            .finish()
    }
}

impl RedisBackend {
    /// Validates the URL. Does not connect.
    pub fn new(redis_url: &str) -> Result<Self, BackendError> {
        let client = Client::open(redis_url)
            .map_err(|e| BackendError::Unavailable(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            script: Script::new(TOKEN_BUCKET_LUA),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<ConnectionManager, BackendError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(redis_error)?;
                info!("Connected to Redis rate-limit store");
                Ok::<_, BackendError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    fn bucket_key(&self, tier: &str, key: &str) -> String {
        format!("{}:{tier}:{key}", self.key_prefix)
    }
}

fn redis_error(e: redis::RedisError) -> BackendError {
    BackendError::Unavailable(e.to_string())
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms.max(0)).unwrap_or(0))
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn try_acquire(
        &self,
        key: &str,
        tier: &str,
        quota: &TierQuota,
        cost: u32,
    ) -> Result<Decision, BackendError> {
        let mut conn = self.connection().await?;
        let interval_ms = quota.refill_interval().as_secs_f64() * 1000.0;
        let bucket = self.bucket_key(tier, key);
        let admissions = format!("{bucket}:window");
        let window_ms = u64::try_from(quota.window.as_millis()).unwrap_or(u64::MAX);

        let (allowed, remaining, retry_after_ms, reset_ms): (i64, i64, i64, i64) = self
            .script
            .key(&bucket)
            .key(&admissions)
            .arg(quota.max_tokens())
            .arg(interval_ms)
            .arg(cost.max(1))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        debug!(bucket = %bucket, allowed, remaining, "Redis token bucket checked");

        let decision = match allowed {
            1 => Decision::Allowed {
                limit: quota.capacity,
                remaining: to_u32(remaining),
                reset: to_duration(reset_ms),
            },
            0 => Decision::Throttled {
                limit: quota.capacity,
                retry_after: to_duration(retry_after_ms),
                reset: to_duration(reset_ms),
            },
            other => {
                return Err(BackendError::Protocol(format!(
                    "unexpected allowed flag {other}"
                )));
            }
        };
        Ok(decision)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("unexpected PING reply '{pong}'")))
        }
    }
}
