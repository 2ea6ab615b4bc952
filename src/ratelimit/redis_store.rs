//! Redis-backed sliding log.
//!
//! Each identifier maps to a sorted set whose members are admitted requests
//! scored by their millisecond timestamp. A Lua script prunes, counts and
//! conditionally records in a single round-trip, so concurrent service
//! instances see one consistent log. Keys expire one window after their
//! last write, which makes an explicit sweep unnecessary.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::store::RateLimitStore;
use super::window::{LimitConfig, RateLimitDecision};
use crate::error::Result;

/// Prune, count, conditionally add, refresh expiry.
///
/// Returns `{allowed, live_count, oldest_score}`.
const ADMIT_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < max then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  allowed = 1
end
if count > 0 then
  redis.call('PEXPIRE', key, window)
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {allowed, count, oldest_score}
";

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix for every key written by the limiter
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            key_prefix: "talktime:ratelimit:".to_string(),
        }
    }
}

/// Sliding-log store on a Redis server.
pub struct RedisStore {
    client: Client,
    /// Shared reconnecting connection, opened on first use
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    script: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Build a store. The URL is validated here; no connection is opened
    /// until the first operation, so an unreachable server surfaces through
    /// the failure policy rather than at startup.
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: config.key_prefix,
            script: redis::Script::new(ADMIT_SCRIPT),
        })
    }

    /// The shared connection. A failed first connect is retried on the
    /// next call.
    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis");
                Ok::<_, redis::RedisError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    /// Redis key for an identifier.
    pub fn key(&self, identifier: &str) -> String {
        format!("{}{}", self.key_prefix, identifier)
    }
}

/// Convert the script reply into a decision.
fn decision_from_reply(
    reply: (i64, i64, i64),
    now_ms: u64,
    limits: &LimitConfig,
) -> RateLimitDecision {
    let (allowed, count, oldest) = reply;
    let reset_after_ms = if oldest < 0 {
        0
    } else {
        (oldest as u64)
            .saturating_add(limits.window_ms())
            .saturating_sub(now_ms)
    };

    if allowed == 1 {
        let remaining = (limits.max_requests() as i64 - count).max(0) as u32;
        RateLimitDecision::allowed(remaining, reset_after_ms)
    } else {
        RateLimitDecision::denied(reset_after_ms)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn admit(
        &self,
        identifier: &str,
        now_ms: u64,
        limits: &LimitConfig,
    ) -> Result<RateLimitDecision> {
        let mut conn = self.connection().await?;
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let reply: (i64, i64, i64) = self
            .script
            .key(self.key(identifier))
            .arg(now_ms)
            .arg(limits.window_ms())
            .arg(limits.max_requests())
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(decision_from_reply(reply, now_ms, limits))
    }

    async fn reset(&self, identifier: &str, _now_ms: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(identifier))
            .query_async(&mut conn)
            .await?;
        debug!(identifier = %identifier, removed, "Redis rate limit reset");
        Ok(())
    }

    async fn sweep(&self, _now_ms: u64, _limits: &LimitConfig) -> Result<usize> {
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
