use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use parking_lot::Mutex;

/// Time source for rate-limit windows, cache TTLs, backoff and latency.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time anchored to tokio's monotonic clock.
///
/// Under `tokio::time::pause` both `now` and `sleep` follow the paused
/// runtime, so tests get deterministic timestamps for free.
pub struct TokioClock {
    origin: tokio::time::Instant,
    origin_utc: DateTime<Utc>,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            origin_utc: Utc::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.origin);
        self.origin_utc + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Hand-driven clock. `sleep` advances time instead of waiting.
#[cfg(test)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Milliseconds between two instants, clamped at zero.
pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(elapsed_ms(start, clock.now()), 90_000);
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.sleep(Duration::from_millis(250)).await;
        assert_eq!(elapsed_ms(start, clock.now()), 250);
        clock.advance(Duration::from_secs(1));
        assert_eq!(elapsed_ms(start, clock.now()), 1250);
    }

    #[test]
    fn test_elapsed_ms_never_negative() {
        let now = Utc::now();
        assert_eq!(elapsed_ms(now, now - chrono::Duration::seconds(5)), 0);
    }
}
