//! Queue lifecycle counters and latency statistics.
//!
//! Observation only: nothing in here feeds back into scheduling.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::ai_queue::types::{AiRequestType, QueueStatus, Usage};

/// Samples kept per histogram; older samples roll off.
const LATENCY_WINDOW: usize = 1024;

/// Consecutive failures after which a provider reports unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug, Clone, Default)]
struct LatencyWindow {
    samples: VecDeque<u64>,
}

impl LatencyWindow {
    fn record(&mut self, ms: u64) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn percentiles(&self) -> LatencyPercentiles {
        if self.samples.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        LatencyPercentiles {
            samples: sorted.len(),
            p50_ms: percentile(&sorted, 50),
            p95_ms: percentile(&sorted, 95),
            p99_ms: percentile(&sorted, 99),
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyPercentiles {
    pub samples: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// How one provider attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Timeout,
    Failure,
}

#[derive(Debug, Clone, Default)]
struct ProviderStats {
    attempts: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    latency: LatencyWindow,
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub healthy: bool,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub latency: LatencyPercentiles,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub queue: QueueStatus,
    pub cancelled: u64,
    pub rate_limit_hits: u64,
    pub cache_hits: u64,
    pub dedup_joins: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub latency_by_type: HashMap<AiRequestType, LatencyPercentiles>,
}

#[derive(Debug, Default)]
struct MetricsState {
    status: QueueStatus,
    cancelled: u64,
    rate_limit_hits: u64,
    cache_hits: u64,
    dedup_joins: u64,
    retries: u64,
    fallbacks: u64,
    latency_by_type: HashMap<AiRequestType, LatencyWindow>,
    providers: HashMap<String, ProviderStats>,
}

impl MetricsState {
    fn finish(&mut self) {
        self.status.total_processed = self.status.completed + self.status.failed;
    }
}

/// Every lifecycle transition updates the counters under one lock, so a
/// snapshot always satisfies the counter-sum invariant.
#[derive(Default)]
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register providers so they show up in health before first use.
    pub fn register_provider(&self, provider: &str) {
        self.state
            .lock()
            .providers
            .entry(provider.to_string())
            .or_default();
    }

    pub fn record_enqueued(&self) {
        let mut state = self.state.lock();
        state.status.total_submitted += 1;
        state.status.pending += 1;
    }

    pub fn record_dispatched(&self) {
        let mut state = self.state.lock();
        state.status.pending = state.status.pending.saturating_sub(1);
        state.status.processing += 1;
    }

    pub fn record_finished(&self, request_type: AiRequestType, success: bool, latency_ms: u64) {
        let mut state = self.state.lock();
        state.status.processing = state.status.processing.saturating_sub(1);
        if success {
            state.status.completed += 1;
        } else {
            state.status.failed += 1;
        }
        state.finish();
        state
            .latency_by_type
            .entry(request_type)
            .or_default()
            .record(latency_ms);
    }

    /// A queued entry that never reached a provider.
    pub fn record_cancelled_pending(&self) {
        let mut state = self.state.lock();
        state.status.pending = state.status.pending.saturating_sub(1);
        state.status.failed += 1;
        state.cancelled += 1;
        state.finish();
    }

    /// A dispatched entry aborted by shutdown.
    pub fn record_cancelled_processing(&self) {
        let mut state = self.state.lock();
        state.status.processing = state.status.processing.saturating_sub(1);
        state.status.failed += 1;
        state.cancelled += 1;
        state.finish();
    }

    pub fn record_rate_limited(&self) {
        self.state.lock().rate_limit_hits += 1;
    }

    pub fn record_cache_hit(&self) {
        self.state.lock().cache_hits += 1;
    }

    pub fn record_dedup_join(&self) {
        self.state.lock().dedup_joins += 1;
    }

    pub fn record_retry(&self) {
        self.state.lock().retries += 1;
    }

    pub fn record_fallback(&self) {
        self.state.lock().fallbacks += 1;
    }

    pub fn record_attempt(
        &self,
        provider: &str,
        outcome: AttemptOutcome,
        latency_ms: u64,
        error: Option<String>,
        at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        let stats = state.providers.entry(provider.to_string()).or_default();
        stats.attempts += 1;
        stats.latency.record(latency_ms);
        match outcome {
            AttemptOutcome::Success => {
                stats.successes += 1;
                stats.consecutive_failures = 0;
                stats.last_success_at = Some(at);
            }
            AttemptOutcome::Timeout | AttemptOutcome::Failure => {
                if outcome == AttemptOutcome::Timeout {
                    stats.timeouts += 1;
                }
                stats.failures += 1;
                stats.consecutive_failures += 1;
                stats.last_error = error;
            }
        }
    }

    pub fn record_usage(&self, provider: &str, usage: &Usage) {
        let mut state = self.state.lock();
        let stats = state.providers.entry(provider.to_string()).or_default();
        stats.input_tokens += u64::from(usage.input_tokens);
        stats.output_tokens += u64::from(usage.output_tokens);
        stats.cost_usd += usage.cost_usd;
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            queue: state.status,
            cancelled: state.cancelled,
            rate_limit_hits: state.rate_limit_hits,
            cache_hits: state.cache_hits,
            dedup_joins: state.dedup_joins,
            retries: state.retries,
            fallbacks: state.fallbacks,
            latency_by_type: state
                .latency_by_type
                .iter()
                .map(|(t, w)| (*t, w.percentiles()))
                .collect(),
        }
    }

    /// Providers sorted by name.
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        let state = self.state.lock();
        let mut health: Vec<ProviderHealth> = state
            .providers
            .iter()
            .map(|(name, s)| ProviderHealth {
                provider: name.clone(),
                healthy: s.consecutive_failures < UNHEALTHY_AFTER,
                attempts: s.attempts,
                successes: s.successes,
                failures: s.failures,
                timeouts: s.timeouts,
                consecutive_failures: s.consecutive_failures,
                last_error: s.last_error.clone(),
                last_success_at: s.last_success_at,
                latency: s.latency.percentiles(),
                input_tokens: s.input_tokens,
                output_tokens: s.output_tokens,
                cost_usd: s.cost_usd,
            })
            .collect();
        health.sort_by(|a, b| a.provider.cmp(&b.provider));
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(status: &QueueStatus) {
        assert_eq!(
            status.pending + status.processing + status.completed + status.failed,
            status.total_submitted
        );
        assert_eq!(status.total_processed, status.completed + status.failed);
    }

    #[test]
    fn test_lifecycle_counters_hold_invariant() {
        let metrics = MetricsCollector::new();
        for _ in 0..4 {
            metrics.record_enqueued();
        }
        assert_invariant(&metrics.queue_status());

        metrics.record_dispatched();
        metrics.record_dispatched();
        metrics.record_finished(AiRequestType::Analysis, true, 120);
        metrics.record_finished(AiRequestType::Analysis, false, 300);
        metrics.record_cancelled_pending();

        let status = metrics.queue_status();
        assert_invariant(&status);
        assert_eq!(status.pending, 1);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 2);
        assert_eq!(metrics.snapshot().cancelled, 1);
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let mut window = LatencyWindow::default();
        for ms in 1..=100 {
            window.record(ms);
        }
        let p = window.percentiles();
        assert_eq!(p.samples, 100);
        assert_eq!(p.p50_ms, 50);
        assert_eq!(p.p95_ms, 95);
        assert_eq!(p.p99_ms, 99);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let mut window = LatencyWindow::default();
        for ms in 0..(LATENCY_WINDOW as u64 + 10) {
            window.record(ms);
        }
        assert_eq!(window.percentiles().samples, LATENCY_WINDOW);
    }

    #[test]
    fn test_provider_health_tracks_failures_and_recovery() {
        let metrics = MetricsCollector::new();
        metrics.register_provider("secondary");
        let now = Utc::now();
        for _ in 0..3 {
            metrics.record_attempt("primary", AttemptOutcome::Timeout, 30_000, Some("timeout".into()), now);
        }

        let health = metrics.provider_health();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].provider, "primary");
        assert!(!health[0].healthy);
        assert_eq!(health[0].timeouts, 3);
        assert!(health[1].healthy);

        metrics.record_attempt("primary", AttemptOutcome::Success, 800, None, now);
        metrics.record_usage(
            "primary",
            &Usage {
                input_tokens: 100,
                output_tokens: 40,
                cost_usd: 0.002,
            },
        );
        let primary = &metrics.provider_health()[0];
        assert!(primary.healthy);
        assert_eq!(primary.consecutive_failures, 0);
        assert_eq!(primary.last_success_at, Some(now));
        assert_eq!(primary.input_tokens, 100);
        assert_eq!(primary.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_snapshot_counts() {
        let metrics = MetricsCollector::new();
        metrics.record_rate_limited();
        metrics.record_cache_hit();
        metrics.record_dedup_join();
        metrics.record_dedup_join();
        metrics.record_retry();
        metrics.record_fallback();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rate_limit_hits, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.dedup_joins, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.fallbacks, 1);
    }
}
