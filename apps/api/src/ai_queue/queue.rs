//! AI Request Queue
//!
//! The orchestrator in front of every provider call. A submission is
//! validated, checked against the caller's quota, deduplicated against the
//! cache and in-flight work, and otherwise queued in one of three priority
//! lanes. A fixed pool of workers, each holding a concurrency permit while it
//! works, pops the highest-priority entry and hands it to the dispatcher.
//! The single outcome is cached (on success) and delivered to every waiter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ai_queue::cache::{Admission, CacheConfig, DedupKey, ResponseCache, Waiter};
use crate::ai_queue::clock::{elapsed_ms, Clock};
use crate::ai_queue::concurrency::ConcurrencyLimiter;
use crate::ai_queue::dispatcher::{ProviderDispatcher, ProviderRoutes, RetryPolicy};
use crate::ai_queue::error::{AiError, ErrorClass};
use crate::ai_queue::metrics::{MetricsCollector, MetricsSnapshot, ProviderHealth};
use crate::ai_queue::provider::ProviderClient;
use crate::ai_queue::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::ai_queue::types::{AiRequest, AiResponse, Priority, QueueStatus, RateLimitStatus};

/// How often stale rate-limit windows and cache entries are swept.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker tasks pulling from the queue
    pub workers: usize,
    /// Global ceiling on simultaneous provider calls
    pub max_concurrent: usize,
    /// Optional ceiling per provider
    pub max_concurrent_per_provider: Option<usize>,
    /// Queued entries allowed before submissions are rejected
    pub max_queue_size: usize,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    /// Per-attempt provider timeout
    pub provider_timeout: Duration,
    /// How long shutdown waits for in-flight work
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrent: 4,
            max_concurrent_per_provider: None,
            max_queue_size: 1000,
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            provider_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct QueuedEntry {
    key: DedupKey,
    request: AiRequest,
}

/// Three FIFO lanes; high drains before normal before low.
#[derive(Debug, Default)]
struct PriorityLanes {
    high: VecDeque<QueuedEntry>,
    normal: VecDeque<QueuedEntry>,
    low: VecDeque<QueuedEntry>,
    /// No new entries accepted
    closed: bool,
    /// Workers may no longer pop
    dispatch_stopped: bool,
}

impl PriorityLanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedEntry> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn push(&mut self, entry: QueuedEntry) {
        let priority = entry.request.priority;
        self.lane_mut(priority).push_back(entry);
    }

    fn pop(&mut self) -> Option<QueuedEntry> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn remove(&mut self, key: &DedupKey) -> Option<QueuedEntry> {
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(pos) = lane.iter().position(|e| e.key == *key) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Move a still-queued entry to the back of a higher lane.
    fn promote(&mut self, key: &DedupKey, priority: Priority) -> bool {
        let Some(entry) = self.remove(key) else {
            return false;
        };
        self.lane_mut(priority).push_back(entry);
        true
    }

    fn drain(&mut self) -> Vec<QueuedEntry> {
        let mut all: Vec<QueuedEntry> = self.high.drain(..).collect();
        all.extend(self.normal.drain(..));
        all.extend(self.low.drain(..));
        all
    }
}

struct QueueInner {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    limiter: Arc<ConcurrencyLimiter>,
    dispatcher: ProviderDispatcher,
    metrics: Arc<MetricsCollector>,
    lanes: Mutex<PriorityLanes>,
    /// Wakes idle workers when an entry is queued
    notify: Notify,
    /// Signalled whenever a dispatched entry finishes, for the shutdown drain
    finished: Notify,
    accepting: AtomicBool,
    /// Stops workers and the janitor
    stop: CancellationToken,
    /// Aborts dispatches still running when the grace period ends
    abort: CancellationToken,
}

impl QueueInner {
    /// Admission time comes from the queue clock, not the caller's.
    fn stamp(&self, request: AiRequest) -> AiRequest {
        AiRequest {
            submitted_at: self.clock.now(),
            ..request
        }
    }

    /// Runs under the cache lock (see `ResponseCache::admit`).
    fn enqueue(&self, key: DedupKey, request: AiRequest) -> Result<(), AiError> {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return Err(AiError::ShuttingDown);
        }
        if lanes.len() >= self.config.max_queue_size {
            warn!(
                queue_size = lanes.len(),
                max_size = self.config.max_queue_size,
                "AI request queue is full, rejecting request"
            );
            return Err(AiError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        debug!(
            request_id = %request.id,
            dedup_key = %key,
            priority = ?request.priority,
            request_type = %request.request_type,
            queue_size = lanes.len() + 1,
            "Enqueued AI request"
        );
        lanes.push(QueuedEntry { key, request });
        self.metrics.record_enqueued();
        drop(lanes);

        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next entry for dispatch. Counted as processing under the
    /// lanes lock so shutdown never misses a popped entry.
    fn next_entry(&self) -> Option<QueuedEntry> {
        let mut lanes = self.lanes.lock();
        if lanes.dispatch_stopped {
            return None;
        }
        let entry = lanes.pop()?;
        self.metrics.record_dispatched();
        if lanes.len() > 0 {
            self.notify.notify_one();
        }
        Some(entry)
    }

    /// Detach a caller that stopped waiting. A queued entry left with no
    /// waiters is removed before any provider call is made.
    fn detach(&self, key: &DedupKey, request_id: Uuid) {
        let discarded = self
            .cache
            .remove_waiter(key, request_id, || self.lanes.lock().remove(key).is_some());
        if discarded {
            self.metrics.record_cancelled_pending();
            info!(request_id = %request_id, dedup_key = %key, "Cancelled AI request before dispatch");
        } else {
            debug!(request_id = %request_id, dedup_key = %key, "Caller stopped waiting on AI request");
        }
    }

    async fn process(&self, worker_id: usize, entry: QueuedEntry) {
        let QueuedEntry { key, request } = entry;
        debug!(
            worker_id,
            request_id = %request.id,
            dedup_key = %key,
            priority = ?request.priority,
            "Dispatching AI request"
        );

        let started = self.clock.now();
        debug!(
            worker_id,
            request_id = %request.id,
            queued_ms = elapsed_ms(request.submitted_at, started),
            "AI request left the queue"
        );
        let outcome = self.dispatcher.dispatch(&request, &self.abort).await;
        let latency_ms = elapsed_ms(started, self.clock.now());

        match &outcome {
            Ok(response) => {
                self.metrics
                    .record_finished(request.request_type, true, latency_ms);
                info!(
                    worker_id,
                    request_id = %request.id,
                    provider = %response.provider,
                    duration_ms = latency_ms,
                    "AI request completed"
                );
            }
            Err(AiError::Cancelled) => {
                self.metrics.record_cancelled_processing();
                warn!(worker_id, request_id = %request.id, "AI request aborted during shutdown");
            }
            Err(err) => {
                self.metrics
                    .record_finished(request.request_type, false, latency_ms);
                error!(
                    worker_id,
                    request_id = %request.id,
                    provider = err.provider().unwrap_or("none"),
                    attempts = err.attempts().unwrap_or(0),
                    retryable = err.class() == ErrorClass::Retryable,
                    error = %err,
                    "AI request failed permanently"
                );
            }
        }
        self.finished.notify_waiters();

        let waiters = self.cache.complete(&key, &outcome);
        for waiter in waiters {
            let result = match &outcome {
                Ok(response) => Ok(response.for_request(waiter.request_id)),
                Err(err) => Err(err.clone()),
            };
            let _ = waiter.tx.send(result);
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Worker started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                permit = self.limiter.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let entry = match self.next_entry() {
                Some(entry) => entry,
                None => {
                    permit.release();
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                    continue;
                }
            };

            self.process(worker_id, entry).await;
            permit.release();
        }

        debug!(worker_id, "Worker stopped");
    }

    async fn janitor_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(JANITOR_INTERVAL) => {
                    let windows = self.rate_limiter.purge_expired();
                    let responses = self.cache.purge_expired();
                    if windows + responses > 0 {
                        debug!(
                            windows,
                            responses,
                            tracked_users = self.rate_limiter.tracked_users(),
                            cached = self.cache.len(),
                            "Purged expired rate-limit windows and cached responses"
                        );
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    pub accepting: bool,
    /// Entries waiting in the priority lanes
    pub queued: usize,
    /// Distinct requests queued or being dispatched
    pub in_flight: usize,
    pub cached_responses: usize,
    /// Users with an open rate-limit window
    pub tracked_users: usize,
    pub concurrency_in_use: usize,
    pub concurrency_available: usize,
    pub queue: QueueStatus,
}

/// Detaches its caller on drop unless the outcome was received.
struct WaiterGuard {
    inner: Arc<QueueInner>,
    key: DedupKey,
    request_id: Uuid,
    armed: bool,
}

impl WaiterGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.detach(&self.key, self.request_id);
        }
    }
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct AiRequestQueue {
    inner: Arc<QueueInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AiRequestQueue {
    pub fn new(
        config: QueueConfig,
        providers: Vec<Arc<dyn ProviderClient>>,
        routes: ProviderRoutes,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let provider_names: Vec<String> = providers.iter().map(|p| p.name().to_string()).collect();
        let limiter = Arc::new(ConcurrencyLimiter::new(
            config.max_concurrent,
            config.max_concurrent_per_provider,
            provider_names,
        ));
        let dispatcher = ProviderDispatcher::new(
            providers,
            routes,
            config.retry,
            config.provider_timeout,
            Arc::clone(&clock),
            Arc::clone(&limiter),
            Arc::clone(&metrics),
        );

        let inner = QueueInner {
            rate_limiter: RateLimiter::new(config.rate_limit, Arc::clone(&clock)),
            cache: ResponseCache::new(config.cache, Arc::clone(&clock)),
            limiter,
            dispatcher,
            metrics,
            lanes: Mutex::new(PriorityLanes::default()),
            notify: Notify::new(),
            finished: Notify::new(),
            accepting: AtomicBool::new(true),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            clock,
            config,
        };

        Self {
            inner: Arc::new(inner),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the worker pool and the janitor. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.inner.stop.is_cancelled() {
            return;
        }

        let worker_count = self.inner.config.workers.max(1);
        for worker_id in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(inner.worker_loop(worker_id)));
        }
        tasks.push(tokio::spawn(Arc::clone(&self.inner).janitor_loop()));

        info!(
            worker_count,
            max_concurrent = self.inner.limiter.max_concurrent(),
            providers = ?self.inner.dispatcher.provider_names(),
            "Started AI request queue workers"
        );
    }

    /// Submit a request and wait for its outcome.
    pub async fn submit(&self, request: AiRequest) -> Result<AiResponse, AiError> {
        self.submit_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like `submit`, but gives up with `Cancelled` when `cancel` fires.
    /// Dropping the returned future has the same effect.
    pub async fn submit_with_cancel(
        &self,
        request: AiRequest,
        cancel: CancellationToken,
    ) -> Result<AiResponse, AiError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(AiError::ShuttingDown);
        }

        request.validate()?;
        let request = inner.stamp(request);

        if let Err(err) = inner.rate_limiter.check_and_consume(&request.user_id) {
            inner.metrics.record_rate_limited();
            warn!(
                request_id = %request.id,
                user_id = %request.user_id,
                error = %err,
                "Rejected AI request over per-user quota"
            );
            return Err(err);
        }

        if cancel.is_cancelled() {
            return Err(AiError::Cancelled);
        }

        let key = DedupKey::for_request(&request);
        let request_id = request.id;
        let priority = request.priority;
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { request_id, tx };

        match inner
            .cache
            .admit(key, waiter, priority, || inner.enqueue(key, request))?
        {
            Admission::Cached(response) => {
                inner.metrics.record_cache_hit();
                debug!(request_id = %request_id, dedup_key = %key, "Served AI request from cache");
                return Ok(response.for_request(request_id));
            }
            Admission::Joined { leader, raised_to } => {
                inner.metrics.record_dedup_join();
                if let Some(raised) = raised_to {
                    inner.lanes.lock().promote(&key, raised);
                }
                debug!(
                    request_id = %request_id,
                    leader = %leader,
                    dedup_key = %key,
                    "Joined in-flight AI request"
                );
            }
            Admission::Created => {}
        }

        let mut guard = WaiterGuard {
            inner: Arc::clone(inner),
            key,
            request_id,
            armed: true,
        };

        tokio::select! {
            result = rx => {
                guard.disarm();
                result.unwrap_or(Err(AiError::Cancelled))
            }
            _ = cancel.cancelled() => Err(AiError::Cancelled),
        }
    }

    /// Stop accepting work, let in-flight requests finish within the grace
    /// period, then abort stragglers and cancel everything still queued.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down AI request queue");

        {
            let mut lanes = inner.lanes.lock();
            lanes.closed = true;
            lanes.dispatch_stopped = true;
        }
        inner.stop.cancel();

        let drained = tokio::time::timeout(inner.config.shutdown_grace, async {
            loop {
                // Registered before the check so a finish in between is not missed.
                let finished = inner.finished.notified();
                if inner.metrics.queue_status().processing == 0 {
                    break;
                }
                finished.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                grace_ms = inner.config.shutdown_grace.as_millis() as u64,
                "Grace period elapsed, aborting in-flight AI requests"
            );
            inner.abort.cancel();
        }

        let remaining = inner.lanes.lock().drain();
        let cancelled = remaining.len();
        for entry in remaining {
            inner.metrics.record_cancelled_pending();
            for waiter in inner.cache.abandon(&entry.key) {
                let _ = waiter.tx.send(Err(AiError::Cancelled));
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        inner.limiter.close();

        info!(cancelled, drained, "AI request queue stopped");
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.inner.metrics.queue_status()
    }

    /// Live view of the queue's shared structures.
    pub fn overview(&self) -> QueueOverview {
        let inner = &self.inner;
        QueueOverview {
            accepting: self.is_accepting(),
            queued: self.queued_len(),
            in_flight: inner.cache.in_flight_len(),
            cached_responses: inner.cache.len(),
            tracked_users: inner.rate_limiter.tracked_users(),
            concurrency_in_use: inner.limiter.in_use(),
            concurrency_available: inner.limiter.available(),
            queue: self.queue_status(),
        }
    }

    pub fn rate_limit_status(&self, user_id: &str) -> RateLimitStatus {
        self.inner.rate_limiter.status(user_id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.inner.metrics.provider_health()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lanes.lock().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }
}
