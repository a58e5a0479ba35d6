//! Per-user admission gate.
//!
//! Fixed window per user: the window opens at the user's first request and
//! admits `max_requests` until `window_start + window`. Check and decrement
//! happen under one lock, so concurrent submissions can never overspend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::ai_queue::clock::{elapsed_ms, Clock};
use crate::ai_queue::error::AiError;
use crate::ai_queue::types::RateLimitStatus;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UserWindow {
    started_at: DateTime<Utc>,
    used: u32,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, UserWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let window = chrono::Duration::from_std(config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            config,
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `user_id`, consuming quota, or reject it with
    /// the instant the window resets.
    pub fn check_and_consume(&self, user_id: &str) -> Result<RateLimitStatus, AiError> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();

        let entry = windows.entry(user_id.to_string()).or_insert(UserWindow {
            started_at: now,
            used: 0,
        });
        if now >= entry.started_at + self.window {
            *entry = UserWindow {
                started_at: now,
                used: 0,
            };
        }

        let reset_time = entry.started_at + self.window;
        if entry.used >= self.config.max_requests {
            debug!(user_id, %reset_time, "Per-user rate limit hit");
            return Err(AiError::RateLimited {
                user_id: user_id.to_string(),
                limit: self.config.max_requests,
                reset_time,
                retry_after_ms: elapsed_ms(now, reset_time),
            });
        }

        entry.used += 1;
        let requests_remaining = self.config.max_requests - entry.used;
        Ok(RateLimitStatus {
            requests_remaining,
            reset_time,
            is_limited: requests_remaining == 0,
        })
    }

    /// Read-only view of a user's quota.
    pub fn status(&self, user_id: &str) -> RateLimitStatus {
        let now = self.clock.now();
        let windows = self.windows.lock();

        match windows.get(user_id) {
            Some(w) if now < w.started_at + self.window => {
                let requests_remaining = self.config.max_requests.saturating_sub(w.used);
                RateLimitStatus {
                    requests_remaining,
                    reset_time: w.started_at + self.window,
                    is_limited: requests_remaining == 0,
                }
            }
            _ => RateLimitStatus {
                requests_remaining: self.config.max_requests,
                reset_time: now + self.window,
                is_limited: self.config.max_requests == 0,
            },
        }
    }

    /// Drop windows that have already reset. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now < w.started_at + self.window);
        before - windows.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_queue::clock::ManualClock;

    fn limiter(max_requests: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(
            RateLimitConfig {
                max_requests,
                window: Duration::from_secs(60),
            },
            clock.clone(),
        );
        (limiter, clock)
    }

    #[test]
    fn test_sixth_request_rejected_with_future_reset() {
        let (limiter, clock) = limiter(5);
        for expected_remaining in (0..5).rev() {
            let status = limiter.check_and_consume("u1").unwrap();
            assert_eq!(status.requests_remaining, expected_remaining);
        }

        clock.advance(Duration::from_secs(20));
        let err = limiter.check_and_consume("u1").unwrap_err();
        let reset = err.reset_time().expect("rate limit error carries reset time");
        assert!(reset > clock.now());
        assert_eq!(err.retry_after_ms(), Some(40_000));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let (limiter, clock) = limiter(1);
        limiter.check_and_consume("u1").unwrap();
        assert!(limiter.check_and_consume("u1").is_err());

        clock.advance(Duration::from_secs(60));
        let status = limiter.check_and_consume("u1").unwrap();
        assert_eq!(status.requests_remaining, 0);
        assert!(status.is_limited);
    }

    #[test]
    fn test_users_are_independent() {
        let (limiter, _clock) = limiter(1);
        limiter.check_and_consume("u1").unwrap();
        assert!(limiter.check_and_consume("u1").is_err());
        assert!(limiter.check_and_consume("u2").is_ok());
    }

    #[test]
    fn test_status_does_not_consume() {
        let (limiter, _clock) = limiter(3);
        limiter.check_and_consume("u1").unwrap();
        for _ in 0..5 {
            assert_eq!(limiter.status("u1").requests_remaining, 2);
        }
        assert_eq!(limiter.status("nobody").requests_remaining, 3);
        assert_eq!(limiter.tracked_users(), 1);
    }

    #[test]
    fn test_rejection_does_not_drive_quota_negative() {
        let (limiter, _clock) = limiter(2);
        for _ in 0..10 {
            let _ = limiter.check_and_consume("u1");
        }
        let status = limiter.status("u1");
        assert_eq!(status.requests_remaining, 0);
        assert!(status.is_limited);
    }

    #[test]
    fn test_zero_quota_rejects_everything() {
        let (limiter, _clock) = limiter(0);
        assert!(limiter.check_and_consume("u1").is_err());
        assert!(limiter.status("u1").is_limited);
    }

    #[test]
    fn test_purge_expired_windows() {
        let (limiter, clock) = limiter(5);
        limiter.check_and_consume("u1").unwrap();
        clock.advance(Duration::from_secs(30));
        limiter.check_and_consume("u2").unwrap();
        clock.advance(Duration::from_secs(31));

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_users(), 1);
    }

    #[test]
    fn test_concurrent_consumers_never_overspend() {
        let (limiter, _clock) = limiter(50);
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_and_consume("u1").is_ok())
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
