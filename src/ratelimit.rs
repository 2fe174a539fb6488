//! Sliding-window rate limiter
//!
//! Keyed concurrent store of per-identity request windows. Admission prunes
//! timestamps older than the window, then counts; a denial additionally
//! imposes a cool-down block independent of the counting window, so a
//! client cannot retry the instant the window slides clear. Contention is
//! expected only within one identity key.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admission decision for one request
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed {
        remaining: usize,
        reset_after: Duration,
    },
    Denied {
        retry_after: Duration,
    },
}

impl Admission {
    #[allow(dead_code)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct IdentityWindow {
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Sliding-window limiter with a post-denial cool-down
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    cooldown: Duration,
    state: Mutex<HashMap<String, IdentityWindow>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            max_requests,
            window,
            cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record one request for an identity
    pub fn admit(&self, identity: &str) -> Admission {
        self.admit_at(identity, Instant::now())
    }

    /// Admission at an explicit instant; the seam tests use to drive time
    pub fn admit_at(&self, identity: &str, now: Instant) -> Admission {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = state.entry(identity.to_string()).or_default();

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return Admission::Denied {
                    retry_after: blocked_until - now,
                };
            }
            entry.blocked_until = None;
        }

        while entry
            .timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            entry.timestamps.pop_front();
        }

        if entry.timestamps.len() >= self.max_requests {
            let blocked_until = now + self.cooldown;
            entry.blocked_until = Some(blocked_until);
            return Admission::Denied {
                retry_after: self.cooldown,
            };
        }

        entry.timestamps.push_back(now);

        let reset_after = entry
            .timestamps
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(self.window);

        Admission::Allowed {
            remaining: self.max_requests - entry.timestamps.len(),
            reset_after,
        }
    }

    /// Clear one identity's window and any active block
    #[allow(dead_code)]
    pub fn reset(&self, identity: &str) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.remove(identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(10, Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn test_allows_up_to_max_requests() {
        let limiter = limiter();
        let now = Instant::now();

        for i in 0..10 {
            let admission = limiter.admit_at("user_1", now);
            assert!(admission.is_allowed(), "request {} denied", i + 1);
        }
    }

    #[test]
    fn test_eleventh_request_in_window_is_denied() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..10 {
            limiter.admit_at("user_1", now);
        }

        let admission = limiter.admit_at("user_1", now + Duration::from_secs(1));
        assert!(matches!(admission, Admission::Denied { .. }));
    }

    #[test]
    fn test_cooldown_outlives_the_window() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..10 {
            limiter.admit_at("user_1", now);
        }
        assert!(!limiter.admit_at("user_1", now).is_allowed());

        // 2 minutes later the counting window has slid clear, but the
        // cool-down still holds
        let later = now + Duration::from_secs(120);
        let admission = limiter.admit_at("user_1", later);
        assert!(matches!(admission, Admission::Denied { .. }));

        // After the cool-down, requests flow again
        let after_cooldown = now + Duration::from_secs(301);
        assert!(limiter.admit_at("user_1", after_cooldown).is_allowed());
    }

    #[test]
    fn test_window_slides_without_denial() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..10 {
            limiter.admit_at("user_1", now);
        }

        // No 11th attempt, so no block; once the window slides the
        // identity is clean again
        let later = now + Duration::from_secs(61);
        assert!(limiter.admit_at("user_1", later).is_allowed());
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..11 {
            limiter.admit_at("user_1", now);
        }
        assert!(limiter.admit_at("user_2", now).is_allowed());
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = limiter();
        let now = Instant::now();

        match limiter.admit_at("user_1", now) {
            Admission::Allowed { remaining, .. } => assert_eq!(remaining, 9),
            other => panic!("unexpected {:?}", other),
        }
        match limiter.admit_at("user_1", now) {
            Admission::Allowed { remaining, .. } => assert_eq!(remaining, 8),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reset_clears_identity() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..11 {
            limiter.admit_at("user_1", now);
        }
        limiter.reset("user_1");
        assert!(limiter.admit_at("user_1", now).is_allowed());
    }

    #[test]
    fn test_concurrent_admissions_respect_the_cap() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(
            50,
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.admit_at("shared", now).is_allowed())
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
