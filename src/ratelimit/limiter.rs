//! In-memory sliding-log rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::log::RequestLog;
use super::window::{LimitConfig, RateLimitDecision};
use crate::error::Result;

/// The in-process rate limiter.
///
/// Holds one [`RequestLog`] per identifier. The map is sharded and each
/// check holds the entry lock for its identifier from prune to append, so
/// concurrent callers never push a log past `max_requests`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Request logs indexed by caller identifier
    requests: DashMap<String, RequestLog>,
    limits: LimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(limits: LimitConfig) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(limits: LimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: DashMap::new(),
            limits,
            clock,
        }
    }

    /// Check and record one request for `identifier`.
    ///
    /// Identifiers are opaque; the empty string is a valid key like any other.
    pub fn check_limit(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now_ms();

        trace!(identifier = %identifier, now_ms = now, "Checking rate limit");

        let decision = match self.requests.get_mut(identifier) {
            Some(mut log) => log.admit(now, &self.limits),
            None => self
                .requests
                .entry(identifier.to_string())
                .or_default()
                .admit(now, &self.limits),
        };

        if !decision.allowed {
            debug!(
                identifier = %identifier,
                max_requests = self.limits.max_requests(),
                reset_after_ms = decision.reset_after_ms,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Forget every recorded request for `identifier`.
    pub fn reset(&self, identifier: &str) {
        if self.requests.remove(identifier).is_some() {
            debug!(identifier = %identifier, "Rate limit reset");
        }
    }

    /// Prune all logs and drop identifiers with nothing left in the window.
    ///
    /// Returns the number of identifiers removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let window_ms = self.limits.window_ms();
        let before = self.requests.len();

        self.requests.retain(|_, log| {
            log.prune(now, window_ms);
            !log.is_empty()
        });

        before.saturating_sub(self.requests.len())
    }

    /// Live request count for an identifier, if it has an entry.
    pub fn live_count(&self, identifier: &str) -> Option<usize> {
        let now = self.clock.now_ms();
        self.requests
            .get(identifier)
            .map(|log| log.view(now, self.limits.window_ms()).count)
    }

    /// The configured limits.
    pub fn limits(&self) -> &LimitConfig {
        &self.limits
    }

    /// Clear all logs.
    pub fn clear(&self) {
        self.requests.clear();
    }

    /// Number of tracked identifiers.
    pub fn identifier_count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimitConfig::default())
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check_limit(&self, identifier: &str) -> RateLimitDecision {
        RateLimiter::check_limit(self, identifier)
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        RateLimiter::reset(self, identifier);
        Ok(())
    }

    async fn sweep(&self) -> usize {
        RateLimiter::sweep(self)
    }

    fn limits(&self) -> &LimitConfig {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    fn limiter(window_ms: u64, max_requests: u32) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let limits = LimitConfig::new(window_ms, max_requests).unwrap();
        (RateLimiter::with_clock(limits, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.identifier_count(), 0);
        assert_eq!(limiter.limits().max_requests(), 10);
        assert_eq!(limiter.limits().window_ms(), 60_000);
    }

    #[test]
    fn test_remaining_decreases_to_zero() {
        let (limiter, clock) = limiter(60_000, 5);

        for expected in (0..5).rev() {
            let decision = limiter.check_limit("user-1");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            clock.advance(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_request_over_quota_is_denied() {
        let (limiter, _clock) = limiter(60_000, 3);

        for _ in 0..3 {
            assert!(limiter.check_limit("user-1").allowed);
        }

        let decision = limiter.check_limit("user-1");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(limiter.live_count("user-1"), Some(3));
    }

    #[test]
    fn test_admitted_again_after_window() {
        let (limiter, clock) = limiter(1_000, 2);

        limiter.check_limit("user-1");
        limiter.check_limit("user-1");
        assert!(!limiter.check_limit("user-1").allowed);

        clock.advance(Duration::from_millis(1_000));

        let decision = limiter.check_limit("user-1");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_reset_restores_full_quota() {
        let (limiter, _clock) = limiter(60_000, 2);

        limiter.check_limit("user-1");
        limiter.check_limit("user-1");
        assert!(!limiter.check_limit("user-1").allowed);

        limiter.reset("user-1");
        assert_eq!(limiter.identifier_count(), 0);

        let decision = limiter.check_limit("user-1");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_reset_unknown_identifier_is_noop() {
        let (limiter, _clock) = limiter(60_000, 2);
        limiter.reset("nobody");
        limiter.reset("nobody");
        assert_eq!(limiter.identifier_count(), 0);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (limiter, _clock) = limiter(60_000, 1);

        assert!(limiter.check_limit("alice").allowed);
        assert!(!limiter.check_limit("alice").allowed);

        let decision = limiter.check_limit("bob");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_sliding_window_scenario() {
        let (limiter, clock) = limiter(1_000, 2);
        let start = clock.now_ms();

        let decision = limiter.check_limit("caller");
        assert_eq!(decision, RateLimitDecision::allowed(1, 1_000));

        clock.set(start + 100);
        let decision = limiter.check_limit("caller");
        assert_eq!(decision, RateLimitDecision::allowed(0, 900));

        clock.set(start + 500);
        let decision = limiter.check_limit("caller");
        assert_eq!(decision, RateLimitDecision::denied(500));

        // The t=0 entry has expired, the t=100 entry is still live.
        clock.set(start + 1_001);
        let decision = limiter.check_limit("caller");
        assert_eq!(decision, RateLimitDecision::allowed(0, 99));

        clock.set(start + 1_101);
        let decision = limiter.check_limit("caller");
        assert_eq!(decision, RateLimitDecision::allowed(0, 900));
        assert_eq!(limiter.live_count("caller"), Some(2));
    }

    #[test]
    fn test_empty_identifier_is_a_regular_key() {
        let (limiter, _clock) = limiter(60_000, 1);
        assert!(limiter.check_limit("").allowed);
        assert!(!limiter.check_limit("").allowed);
        assert!(limiter.check_limit(" ").allowed);
    }

    #[test]
    fn test_sweep_removes_expired_identifiers() {
        let (limiter, clock) = limiter(1_000, 5);

        limiter.check_limit("old");
        clock.advance(Duration::from_millis(600));
        limiter.check_limit("fresh");
        clock.advance(Duration::from_millis(500));

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.identifier_count(), 1);
        assert_eq!(limiter.live_count("old"), None);
        assert_eq!(limiter.live_count("fresh"), Some(1));
    }

    #[test]
    fn test_clear() {
        let (limiter, _clock) = limiter(60_000, 5);
        limiter.check_limit("a");
        limiter.check_limit("b");
        assert_eq!(limiter.identifier_count(), 2);

        limiter.clear();
        assert_eq!(limiter.identifier_count(), 0);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_quota() {
        let (limiter, _clock) = limiter(60_000, 50);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_limit("shared").allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert_eq!(limiter.live_count("shared"), Some(50));
    }

    #[tokio::test]
    async fn test_backend_trait_delegates() {
        let (limiter, _clock) = limiter(60_000, 1);
        let backend: &dyn RateLimiterBackend = &limiter;

        assert!(backend.check_limit("x").await.allowed);
        assert!(!backend.check_limit("x").await.allowed);
        backend.reset("x").await.unwrap();
        assert!(backend.check_limit("x").await.allowed);
        assert_eq!(backend.limits().max_requests(), 1);
    }
}
