//! Sliding-window rate limiting for login attempts.
//!
//! State is process-local and resets on restart. Failed attempts are tracked
//! per identifier (the submitted username) and pruned lazily on each check,
//! so the map never needs a background sweeper.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: usize,
    window: Duration,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether an identifier may attempt authentication.
    ///
    /// Prunes attempts older than the window; an identifier is limited while
    /// it still has `max_attempts` failures inside the window. The retry hint
    /// is the time until the oldest remaining failure ages out.
    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        self.check_at(identifier, Instant::now())
    }

    pub fn record_failure(&self, identifier: &str) {
        self.record_failure_at(identifier, Instant::now());
    }

    /// Forget all failures for an identifier. Called on successful login only.
    pub fn reset(&self, identifier: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        attempts.remove(identifier);
    }

    fn check_at(&self, identifier: &str, now: Instant) -> RateLimitDecision {
        let mut attempts = self.attempts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entries) = attempts.get_mut(identifier) else {
            return RateLimitDecision::Allowed;
        };
        entries.retain(|at| now.duration_since(*at) < self.window);
        if entries.is_empty() {
            attempts.remove(identifier);
            return RateLimitDecision::Allowed;
        }
        if entries.len() < self.max_attempts {
            return RateLimitDecision::Allowed;
        }
        let oldest = entries.iter().min().copied().unwrap_or(now);
        let retry_after = (oldest + self.window).saturating_duration_since(now);
        RateLimitDecision::Limited {
            retry_after_seconds: retry_after.as_secs().max(1),
        }
    }

    fn record_failure_at(&self, identifier: &str, now: Instant) {
        let mut attempts = self.attempts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        attempts.entry(identifier.to_string()).or_default().push(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::new(max, Duration::from_secs(window_secs))
    }

    #[test]
    fn allows_until_max_attempts() {
        let limiter = limiter(3, 900);
        let now = Instant::now();
        assert_eq!(limiter.check_at("bob", now), RateLimitDecision::Allowed);
        limiter.record_failure_at("bob", now);
        limiter.record_failure_at("bob", now);
        assert_eq!(limiter.check_at("bob", now), RateLimitDecision::Allowed);
        limiter.record_failure_at("bob", now);
        assert!(matches!(
            limiter.check_at("bob", now),
            RateLimitDecision::Limited { .. }
        ));
    }

    #[test]
    fn retry_after_counts_down_from_oldest() {
        let limiter = limiter(2, 900);
        let start = Instant::now();
        limiter.record_failure_at("bob", start);
        limiter.record_failure_at("bob", start + Duration::from_secs(100));

        let decision = limiter.check_at("bob", start + Duration::from_secs(200));
        assert_eq!(
            decision,
            RateLimitDecision::Limited {
                retry_after_seconds: 700
            }
        );
    }

    #[test]
    fn window_slides_without_explicit_reset() {
        let limiter = limiter(2, 900);
        let start = Instant::now();
        limiter.record_failure_at("bob", start);
        limiter.record_failure_at("bob", start + Duration::from_secs(10));
        assert!(matches!(
            limiter.check_at("bob", start + Duration::from_secs(20)),
            RateLimitDecision::Limited { .. }
        ));

        // The oldest failure ages out, leaving one inside the window.
        assert_eq!(
            limiter.check_at("bob", start + Duration::from_secs(901)),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = limiter(1, 900);
        let now = Instant::now();
        limiter.record_failure_at("bob", now);
        assert!(matches!(
            limiter.check_at("bob", now),
            RateLimitDecision::Limited { .. }
        ));
        assert_eq!(limiter.check_at("alice", now), RateLimitDecision::Allowed);
    }

    #[test]
    fn reset_clears_failures() {
        let limiter = limiter(1, 900);
        let now = Instant::now();
        limiter.record_failure_at("bob", now);
        limiter.reset("bob");
        assert_eq!(limiter.check_at("bob", now), RateLimitDecision::Allowed);
    }

    #[test]
    fn retry_after_is_positive() {
        let limiter = limiter(1, 900);
        let now = Instant::now();
        limiter.record_failure_at("bob", now);
        match limiter.check_at("bob", now + Duration::from_millis(899_900)) {
            RateLimitDecision::Limited {
                retry_after_seconds,
            } => assert!(retry_after_seconds >= 1),
            RateLimitDecision::Allowed => panic!("expected limited"),
        }
    }
}
