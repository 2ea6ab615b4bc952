//! Distributed rate limiter backed by a shared store.
//!
//! The store performs the sliding-log admission; this wrapper bounds each
//! round-trip with a timeout and applies an explicit [`FailurePolicy`] when
//! the store errors or does not answer in time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::store::RateLimitStore;
use super::window::{LimitConfig, RateLimitDecision};
use crate::error::{Result, TalkTimeError};

/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// What to answer when the shared store is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// A rate limiter whose request logs live in a [`RateLimitStore`].
pub struct DistributedRateLimiter<S: RateLimitStore> {
    store: Arc<S>,
    limits: LimitConfig,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    failure_policy: RwLock<FailurePolicy>,
}

impl<S: RateLimitStore> std::fmt::Debug for DistributedRateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("store", &self.store)
            .field("limits", &self.limits)
            .field("store_timeout", &self.store_timeout)
            .field("failure_policy", &*self.failure_policy.read())
            .finish()
    }
}

impl<S: RateLimitStore> DistributedRateLimiter<S> {
    /// Create a distributed limiter using the system clock and defaults.
    pub fn new(store: Arc<S>, limits: LimitConfig) -> Self {
        Self::with_clock(store, limits, Arc::new(SystemClock::new()))
    }

    /// Create a distributed limiter with an explicit clock.
    pub fn with_clock(store: Arc<S>, limits: LimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            limits,
            clock,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            failure_policy: RwLock::new(FailurePolicy::default()),
        }
    }

    /// Bound every store round-trip by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Set the policy applied when the store fails.
    pub fn with_failure_policy(self, policy: FailurePolicy) -> Self {
        self.set_failure_policy(policy);
        self
    }

    /// Change the failure policy at runtime.
    pub fn set_failure_policy(&self, policy: FailurePolicy) {
        *self.failure_policy.write() = policy;
    }

    /// The current failure policy.
    pub fn failure_policy(&self) -> FailurePolicy {
        *self.failure_policy.read()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Check and record one request for `identifier`.
    pub async fn check_limit(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now_ms();

        trace!(
            store = self.store.name(),
            identifier = %identifier,
            now_ms = now,
            "Checking distributed rate limit"
        );

        match self
            .bounded(self.store.admit(identifier, now, &self.limits))
            .await
        {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        store = self.store.name(),
                        identifier = %identifier,
                        max_requests = self.limits.max_requests(),
                        "Distributed rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => self.fallback(identifier, &err),
        }
    }

    /// Discard all recorded requests for `identifier` in the store.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        let now = self.clock.now_ms();
        self.bounded(self.store.reset(identifier, now))
            .await
            .inspect_err(|err| {
                warn!(
                    store = self.store.name(),
                    identifier = %identifier,
                    error = %err,
                    "Rate limit reset failed"
                );
            })
    }

    /// Evict expired state in the store. Failures count as zero evictions.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        match self.bounded(self.store.sweep(now, &self.limits)).await {
            Ok(evicted) => evicted,
            Err(err) => {
                warn!(store = self.store.name(), error = %err, "Store sweep failed");
                0
            }
        }
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.store_timeout, operation)
            .await
            .map_err(|_| TalkTimeError::StoreTimeout(self.store_timeout))?
    }

    fn fallback(&self, identifier: &str, err: &TalkTimeError) -> RateLimitDecision {
        let policy = self.failure_policy();

        warn!(
            store = self.store.name(),
            identifier = %identifier,
            error = %err,
            policy = ?policy,
            "Rate limit store unavailable, applying failure policy"
        );

        match policy {
            FailurePolicy::Open => {
                RateLimitDecision::allowed(self.limits.max_requests().saturating_sub(1), 0)
            }
            FailurePolicy::Closed => RateLimitDecision::denied(self.limits.window_ms()),
        }
    }
}

#[async_trait]
impl<S: RateLimitStore + 'static> RateLimiterBackend for DistributedRateLimiter<S> {
    async fn check_limit(&self, identifier: &str) -> RateLimitDecision {
        DistributedRateLimiter::check_limit(self, identifier).await
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        DistributedRateLimiter::reset(self, identifier).await
    }

    async fn sweep(&self) -> usize {
        DistributedRateLimiter::sweep(self).await
    }

    fn limits(&self) -> &LimitConfig {
        &self.limits
    }
}
