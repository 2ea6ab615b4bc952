//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use super::window::{LimitConfig, RateLimitDecision};
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the in-memory `RateLimiter` and the
/// store-backed `DistributedRateLimiter` so the HTTP layer and the sweeper
/// work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check and record one request for `identifier`.
    async fn check_limit(&self, identifier: &str) -> RateLimitDecision;

    /// Discard all recorded requests for `identifier`.
    async fn reset(&self, identifier: &str) -> Result<()>;

    /// Evict identifiers with no live requests. Returns how many were removed.
    async fn sweep(&self) -> usize;

    /// The limits this backend enforces.
    fn limits(&self) -> &LimitConfig;
}
