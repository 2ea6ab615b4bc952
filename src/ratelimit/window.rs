//! Limit parameters and admission decisions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TalkTimeError};

/// Default sliding window length.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;
/// Default quota per identifier per window.
pub const DEFAULT_MAX_REQUESTS: u32 = 10;

/// Validated limiter parameters.
///
/// Both values are strictly positive. The only way to build one is through
/// [`LimitConfig::new`] or [`Default`], so a limiter can never run with a
/// zero window or a zero quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    window_ms: u64,
    max_requests: u32,
}

impl LimitConfig {
    /// Validate and build a limit configuration.
    pub fn new(window_ms: u64, max_requests: u32) -> Result<Self> {
        if window_ms == 0 {
            return Err(TalkTimeError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(TalkTimeError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            window_ms,
            max_requests,
        })
    }

    /// Length of the sliding window in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Maximum admitted requests per identifier per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Quota left in the current window after this check
    pub remaining: u32,
    /// Milliseconds until the oldest live request leaves the window
    pub reset_after_ms: u64,
}

impl RateLimitDecision {
    /// An admitted request.
    pub fn allowed(remaining: u32, reset_after_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_after_ms,
        }
    }

    /// A rejected request.
    pub fn denied(reset_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_after_ms,
        }
    }

    /// Time until the oldest live request expires.
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }

    /// Whole seconds a rejected client should wait, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_after_ms.div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = LimitConfig::default();
        assert_eq!(limits.window_ms(), 60_000);
        assert_eq!(limits.max_requests(), 10);
        assert_eq!(limits.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = LimitConfig::new(0, 10).unwrap_err();
        assert!(matches!(err, TalkTimeError::Config(_)));
        assert!(err.to_string().contains("window_ms"));
    }

    #[test]
    fn test_zero_quota_rejected() {
        let err = LimitConfig::new(1_000, 0).unwrap_err();
        assert!(matches!(err, TalkTimeError::Config(_)));
        assert!(err.to_string().contains("max_requests"));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(RateLimitDecision::denied(0).retry_after_secs(), 0);
        assert_eq!(RateLimitDecision::denied(1).retry_after_secs(), 1);
        assert_eq!(RateLimitDecision::denied(1_000).retry_after_secs(), 1);
        assert_eq!(RateLimitDecision::denied(1_001).retry_after_secs(), 2);
    }

    #[test]
    fn test_decision_json_shape() {
        let json = serde_json::to_value(RateLimitDecision::allowed(3, 250)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"allowed": true, "remaining": 3, "reset_after_ms": 250})
        );
    }
}
