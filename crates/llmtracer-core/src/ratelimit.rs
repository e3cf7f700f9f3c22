//! Sliding-window admission control
//!
//! Each caller identity keeps the timestamps of its accepted requests inside
//! the trailing window. The table lives in process memory only, so several
//! service instances enforce independent limits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Per-identity sliding-window rate limiter
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    sweep_every: u64,
    checks: AtomicU64,
    // sharded: unrelated identities rarely contend on the same lock
    buckets: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Accept at most `limit` requests per identity in any `window`
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            sweep_every: 1024,
            checks: AtomicU64::new(0),
            buckets: DashMap::new(),
        }
    }

    /// Build from the `[rate_limit]` config section
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_window, config.window).with_sweep_every(config.sweep_every)
    }

    /// Reclaim idle identities every `checks` calls
    pub fn with_sweep_every(mut self, checks: u64) -> Self {
        self.sweep_every = checks.max(1);
        self
    }

    /// Admit or reject a request from `identity` arriving now
    pub fn check(&self, identity: &str) -> Result<()> {
        self.check_at(identity, Instant::now())
    }

    /// Admit or reject a request from `identity` arriving at `now`
    pub fn check_at(&self, identity: &str, now: Instant) -> Result<()> {
        let outcome = {
            let mut bucket = match self.buckets.get_mut(identity) {
                Some(bucket) => bucket,
                None => self.buckets.entry(identity.to_owned()).or_default(),
            };
            evict_expired(&mut bucket, now, self.window);

            // count before recording: the request that would exceed the limit is refused
            if bucket.len() < self.limit {
                bucket.push_back(now);
                Ok(())
            } else {
                let retry_after = bucket
                    .front()
                    .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                    .unwrap_or(self.window);
                Err(Error::RateLimited { retry_after })
            }
        };

        let checks = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if checks % self.sweep_every == 0 {
            self.sweep(now);
        }

        if outcome.is_err() {
            debug!(identity, limit = self.limit, "rate limit exceeded");
        }
        outcome
    }

    /// Identities currently holding a window
    pub fn tracked_identities(&self) -> usize {
        self.buckets.len()
    }

    /// Requests per window
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn sweep(&self, now: Instant) {
        let window = self.window;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < window)
        });
        let reclaimed = before.saturating_sub(self.buckets.len());
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed idle rate limit windows");
        }
    }
}

/// Drop timestamps at or beyond the window boundary
fn evict_expired(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = bucket.front() {
        if now.saturating_duration_since(*oldest) >= window {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ms(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn admits_up_to_limit_then_recovers_after_window() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(1));
        let t0 = Instant::now();

        assert!(limiter.check_at("caller", ms(t0, 100)).is_ok());
        assert!(limiter.check_at("caller", ms(t0, 200)).is_ok());
        assert!(limiter.check_at("caller", ms(t0, 300)).is_ok());
        assert!(matches!(
            limiter.check_at("caller", ms(t0, 400)),
            Err(Error::RateLimited { .. })
        ));
        assert!(limiter.check_at("caller", ms(t0, 1110)).is_ok());
    }

    #[test]
    fn request_at_the_same_instant_as_a_full_burst_is_rejected() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(1));
        let now = Instant::now();
        assert!(limiter.check_at("caller", now).is_ok());
        assert!(limiter.check_at("caller", now).is_ok());
        assert!(limiter.check_at("caller", now).is_err());
    }

    #[test]
    fn timestamp_exactly_on_the_boundary_is_excluded() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(limiter.check_at("caller", t0).is_ok());
        assert!(limiter.check_at("caller", ms(t0, 999)).is_err());
        assert!(limiter.check_at("caller", ms(t0, 1000)).is_ok());
    }

    #[test]
    fn rejected_requests_do_not_extend_the_window() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(limiter.check_at("caller", t0).is_ok());
        for step in 1..10 {
            assert!(limiter.check_at("caller", ms(t0, step * 100)).is_err());
        }
        assert!(limiter.check_at("caller", ms(t0, 1000)).is_ok());
    }

    #[test]
    fn retry_after_points_at_oldest_timestamp_leaving() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        let t0 = Instant::now();
        limiter.check_at("caller", t0).unwrap();
        match limiter.check_at("caller", ms(t0, 250)) {
            Err(Error::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_millis(750));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn identities_are_limited_independently() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_at("project-a", now).is_ok());
        assert!(limiter.check_at("project-b", now).is_ok());
        assert!(limiter.check_at("project-a", now).is_err());
    }

    #[test]
    fn idle_identities_are_reclaimed_lazily() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(1)).with_sweep_every(4);
        let t0 = Instant::now();
        limiter.check_at("a", t0).unwrap();
        limiter.check_at("b", t0).unwrap();
        limiter.check_at("c", t0).unwrap();
        assert_eq!(limiter.tracked_identities(), 3);

        // fourth check happens after the others went idle and triggers the sweep
        limiter.check_at("d", ms(t0, 2000)).unwrap();
        assert_eq!(limiter.tracked_identities(), 1);
    }

    #[test]
    fn concurrent_callers_never_exceed_the_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::new(50, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.check("shared").is_ok()).count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 50);
    }
}
