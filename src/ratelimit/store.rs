//! Shared stores for distributed admission.

use std::fmt::Debug;

use async_trait::async_trait;

use super::window::{LimitConfig, RateLimitDecision};
use crate::error::Result;

/// An external store that runs one sliding-log admission atomically.
///
/// Implementations apply the same rules as the in-memory limiter: prune
/// entries at least `window_ms` old, deny without recording when the live
/// count has reached `max_requests`, otherwise record `now_ms`.
#[async_trait]
pub trait RateLimitStore: Send + Sync + Debug {
    /// Check and record one request.
    async fn admit(
        &self,
        identifier: &str,
        now_ms: u64,
        limits: &LimitConfig,
    ) -> Result<RateLimitDecision>;

    /// Discard all recorded requests for `identifier`.
    async fn reset(&self, identifier: &str, now_ms: u64) -> Result<()>;

    /// Evict expired state. Returns how many identifiers were removed.
    async fn sweep(&self, now_ms: u64, limits: &LimitConfig) -> Result<usize>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
