//! Per-identifier sliding log of admitted requests.

use std::collections::VecDeque;

use super::window::{LimitConfig, RateLimitDecision};

/// Returns true while a timestamp is still inside the window.
///
/// A timestamp exactly `window_ms` old is expired. Timestamps from the
/// future (clock stepped backwards) count as live.
fn is_live(timestamp_ms: u64, now_ms: u64, window_ms: u64) -> bool {
    now_ms.saturating_sub(timestamp_ms) < window_ms
}

/// Summary of live entries, possibly merged across several logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogView {
    /// Number of live timestamps
    pub count: usize,
    /// Oldest live timestamp
    pub oldest: Option<u64>,
}

impl LogView {
    /// Combine two views.
    pub fn merge(self, other: LogView) -> LogView {
        let oldest = match (self.oldest, other.oldest) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        LogView {
            count: self.count + other.count,
            oldest,
        }
    }

    /// Milliseconds until the oldest live entry leaves the window.
    pub fn reset_after_ms(&self, now_ms: u64, window_ms: u64) -> u64 {
        self.oldest
            .map(|t| t.saturating_add(window_ms).saturating_sub(now_ms))
            .unwrap_or(0)
    }
}

/// Ordered timestamps (ms since epoch) of admitted requests for one identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestLog {
    timestamps: VecDeque<u64>,
}

impl RequestLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored timestamps, live or not.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the log holds no timestamps.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Stored timestamps in insertion order.
    pub fn timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.timestamps.iter().copied()
    }

    /// Drop every timestamp that has left the window.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) {
        self.timestamps.retain(|&t| is_live(t, now_ms, window_ms));
    }

    /// Drop every timestamp older than `marker_ms`.
    pub fn discard_before(&mut self, marker_ms: u64) {
        self.timestamps.retain(|&t| t >= marker_ms);
    }

    /// Live entries as of `now_ms`, without mutating the log.
    pub fn view(&self, now_ms: u64, window_ms: u64) -> LogView {
        self.view_since(now_ms, window_ms, 0)
    }

    /// Live entries at or after `marker_ms`, without mutating the log.
    pub fn view_since(&self, now_ms: u64, window_ms: u64, marker_ms: u64) -> LogView {
        self.timestamps
            .iter()
            .copied()
            .filter(|&t| t >= marker_ms && is_live(t, now_ms, window_ms))
            .fold(LogView::default(), |view, t| {
                view.merge(LogView {
                    count: 1,
                    oldest: Some(t),
                })
            })
    }

    /// Run one sliding-log admission against this log alone.
    pub fn admit(&mut self, now_ms: u64, limits: &LimitConfig) -> RateLimitDecision {
        self.admit_with(now_ms, limits, LogView::default())
    }

    /// Run one sliding-log admission where `others` holds live entries
    /// recorded elsewhere (other nodes) that share this quota.
    ///
    /// On denial the pruned log is kept and `now_ms` is not recorded.
    pub fn admit_with(
        &mut self,
        now_ms: u64,
        limits: &LimitConfig,
        others: LogView,
    ) -> RateLimitDecision {
        let window_ms = limits.window_ms();
        let max_requests = limits.max_requests() as usize;

        self.prune(now_ms, window_ms);
        let live = self.view(now_ms, window_ms).merge(others);

        if live.count >= max_requests {
            return RateLimitDecision::denied(live.reset_after_ms(now_ms, window_ms));
        }

        self.timestamps.push_back(now_ms);
        let live = live.merge(LogView {
            count: 1,
            oldest: Some(now_ms),
        });

        RateLimitDecision::allowed(
            (max_requests - live.count) as u32,
            live.reset_after_ms(now_ms, window_ms),
        )
    }

    /// Serialize as comma-separated timestamps for gossip.
    pub fn encode(&self) -> String {
        self.timestamps
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a gossip value. Malformed entries are skipped.
    pub fn decode(value: &str) -> Self {
        let timestamps = value
            .split(',')
            .filter_map(|part| part.trim().parse::<u64>().ok())
            .collect();
        Self { timestamps }
    }
}
