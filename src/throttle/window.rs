//! Fixed-window request volume limiter.
//!
//! Counts every request from an address, successful or not, and denies once
//! the count passes a fixed ceiling. The window resets wholesale when it
//! runs out; there is no progressive delay and no escalation.

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::engine::ceil_secs;
use super::sweeper::Sweep;
use crate::clock::{add_saturating, to_duration, Clock};

/// Ceiling and window length of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window length in seconds
    pub window_secs: u64,
    /// Requests allowed per window
    pub max_requests: u64,
}

impl WindowConfig {
    /// Create a new window configuration.
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            window_secs,
            max_requests,
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Request count for one address in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRecord {
    /// Requests seen in this window
    pub count: u64,
    /// When the window ends
    pub reset_at: DateTime<Utc>,
}

/// Outcome of [`FixedWindowLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowDecision {
    /// Whether the request is within the ceiling
    pub allowed: bool,
    /// The configured ceiling
    pub limit: u64,
    /// Requests left in this window
    pub remaining: u64,
    /// When the window ends
    pub reset_at: DateTime<Utc>,
    /// Wait before retrying (zero when allowed)
    pub retry_after: Duration,
}

impl WindowDecision {
    /// Retry hint rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after)
    }

    /// Informational header values; `Retry-After` only when denied.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            (
                "X-RateLimit-Reset",
                self.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }
}

/// Per-address fixed-window limiter.
pub struct FixedWindowLimiter {
    name: String,
    config: WindowConfig,
    enabled: bool,
    records: DashMap<String, RateLimitRecord>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    /// Create a new limiter.
    pub fn new(name: &str, config: WindowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            config,
            enabled: true,
            records: DashMap::new(),
            clock,
        }
    }

    /// Turn enforcement off; checks still report headers but always allow.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The limiter's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The limiter's configuration.
    pub fn config(&self) -> WindowConfig {
        self.config
    }

    /// Count a request from `address` and decide whether it may proceed.
    pub fn check(&self, address: &str) -> WindowDecision {
        let now = self.clock.now();
        let limit = self.config.max_requests;

        if !self.enabled {
            return WindowDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: add_saturating(now, self.config.window()),
                retry_after: Duration::ZERO,
            };
        }

        let record = {
            let mut entry = self
                .records
                .entry(address.to_string())
                .or_insert_with(|| RateLimitRecord {
                    count: 0,
                    reset_at: now,
                });

            if now >= entry.reset_at {
                trace!(limiter = %self.name, address, "Starting new window");
                *entry = RateLimitRecord {
                    count: 1,
                    reset_at: add_saturating(now, self.config.window()),
                };
            } else {
                entry.count = entry.count.saturating_add(1);
            }
            *entry
        };

        if record.count > limit {
            debug!(
                limiter = %self.name,
                address,
                count = record.count,
                limit,
                "Rate limit exceeded"
            );
            return WindowDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: record.reset_at,
                retry_after: to_duration(record.reset_at - now),
            };
        }

        WindowDecision {
            allowed: true,
            limit,
            remaining: limit - record.count,
            reset_at: record.reset_at,
            retry_after: Duration::ZERO,
        }
    }

    /// Current record for an address.
    pub fn record(&self, address: &str) -> Option<RateLimitRecord> {
        self.records.get(address).map(|r| *r)
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no address is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Sweep for FixedWindowLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| now < record.reset_at);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(limiter = %self.name, removed, "Swept expired windows");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_requests: u64, window_secs: u64) -> (Arc<ManualClock>, FixedWindowLimiter) {
        let clock = Arc::new(ManualClock::at_epoch());
        let limiter = FixedWindowLimiter::new(
            "test",
            WindowConfig::new(max_requests, window_secs),
            clock.clone(),
        );
        (clock, limiter)
    }

    #[test]
    fn test_requests_within_limit() {
        let (_, limiter) = limiter(3, 60);

        let first = limiter.check("10.0.0.1");
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);

        assert!(limiter.check("10.0.0.1").allowed);
        let third = limiter.check("10.0.0.1");
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn test_request_over_limit_is_denied() {
        let (clock, limiter) = limiter(2, 60);
        limiter.check("10.0.0.1");
        clock.advance(Duration::from_millis(10_500));
        limiter.check("10.0.0.1");

        let denied = limiter.check("10.0.0.1");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // 49.5s left rounds up.
        assert_eq!(denied.retry_after_secs(), 50);
    }

    #[test]
    fn test_new_window_after_reset() {
        let (clock, limiter) = limiter(1, 60);
        assert!(limiter.check("10.0.0.1").allowed);
        assert!(!limiter.check("10.0.0.1").allowed);

        clock.advance(Duration::from_secs(60));
        let decision = limiter.check("10.0.0.1");
        assert!(decision.allowed);
        assert_eq!(limiter.record("10.0.0.1").unwrap().count, 1);
        assert_eq!(decision.reset_at, clock.now() + chrono::TimeDelta::seconds(60));
    }

    #[test]
    fn test_addresses_are_independent() {
        let (_, limiter) = limiter(1, 60);
        assert!(limiter.check("10.0.0.1").allowed);
        assert!(limiter.check("10.0.0.2").allowed);
        assert!(!limiter.check("10.0.0.1").allowed);
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let clock = Arc::new(ManualClock::at_epoch());
        let limiter = FixedWindowLimiter::new("test", WindowConfig::new(1, 60), clock).with_enabled(false);

        for _ in 0..10 {
            assert!(limiter.check("10.0.0.1").allowed);
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_headers() {
        let (_, limiter) = limiter(1, 120);
        let allowed = limiter.check("10.0.0.1");
        let headers = allowed.headers();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], ("X-RateLimit-Limit", "1".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Remaining", "0".to_string()));
        assert_eq!(headers[2], ("X-RateLimit-Reset", "1970-01-01T00:02:00.000Z".to_string()));

        let denied = limiter.check("10.0.0.1");
        let headers = denied.headers();
        assert_eq!(headers.last().unwrap(), &("Retry-After", "120".to_string()));
    }

    #[test]
    fn test_huge_window_saturates() {
        let (_, limiter) = limiter(1, 10_000_000_000_000);

        let first = limiter.check("10.0.0.1");
        assert!(first.allowed);
        assert_eq!(first.reset_at, DateTime::<Utc>::MAX_UTC);

        let denied = limiter.check("10.0.0.1");
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
    }

    #[test]
    fn test_sweep_drops_expired_windows() {
        let (clock, limiter) = limiter(5, 60);
        limiter.check("10.0.0.1");
        clock.advance(Duration::from_secs(30));
        limiter.check("10.0.0.2");

        clock.advance(Duration::from_secs(30));
        assert_eq!(Sweep::sweep(&limiter), 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.record("10.0.0.2").is_some());
    }
}
