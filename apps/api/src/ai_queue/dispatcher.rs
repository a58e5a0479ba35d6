//! Provider Dispatcher: the only place provider clients are called.
//!
//! For each request type there is an ordered provider chain: the first entry
//! is primary, the rest are fallbacks. Each provider gets up to
//! `max_retries` retries with jittered exponential backoff; a fatal error
//! returns at once. `max_total_attempts` caps attempts across the chain.
//! A provider's own `retry_after` replaces the backoff; when it exceeds
//! `max_delay` and a fallback remains, the chain moves on instead of waiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai_queue::clock::{elapsed_ms, Clock};
use crate::ai_queue::concurrency::ConcurrencyLimiter;
use crate::ai_queue::error::{AiError, ProviderError};
use crate::ai_queue::metrics::{AttemptOutcome, MetricsCollector};
use crate::ai_queue::provider::{ProviderClient, ProviderReply};
use crate::ai_queue::types::{AiRequest, AiRequestType, AiResponse};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries per provider after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempt budget across every provider in the chain.
    pub max_total_attempts: u32,
    /// Fraction of each delay that may be randomly shaved off (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_total_attempts: 6,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^retry`, capped at `max_delay`, then jittered downward.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let scale = 1.0 - rand::thread_rng().gen_range(0.0..jitter);
        delay.mul_f64(scale)
    }
}

/// Provider chains per request type.
#[derive(Debug, Clone, Default)]
pub struct ProviderRoutes {
    default_chain: Vec<String>,
    by_type: HashMap<AiRequestType, Vec<String>>,
}

impl ProviderRoutes {
    pub fn new(default_chain: Vec<String>) -> Self {
        Self {
            default_chain,
            by_type: HashMap::new(),
        }
    }

    pub fn route(mut self, request_type: AiRequestType, chain: Vec<String>) -> Self {
        self.by_type.insert(request_type, chain);
        self
    }

    pub fn chain(&self, request_type: AiRequestType) -> &[String] {
        self.by_type
            .get(&request_type)
            .unwrap_or(&self.default_chain)
    }
}

pub struct ProviderDispatcher {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
    routes: ProviderRoutes,
    policy: RetryPolicy,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    limiter: Arc<ConcurrencyLimiter>,
    metrics: Arc<MetricsCollector>,
}

impl ProviderDispatcher {
    pub fn new(
        providers: Vec<Arc<dyn ProviderClient>>,
        routes: ProviderRoutes,
        policy: RetryPolicy,
        timeout: Duration,
        clock: Arc<dyn Clock>,
        limiter: Arc<ConcurrencyLimiter>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| {
                metrics.register_provider(p.name());
                (p.name().to_string(), p)
            })
            .collect();
        Self {
            providers,
            routes,
            policy,
            timeout,
            clock,
            limiter,
            metrics,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `request` through its provider chain. `abort` cancels backoff
    /// sleeps and pending provider calls.
    pub async fn dispatch(
        &self,
        request: &AiRequest,
        abort: &CancellationToken,
    ) -> Result<AiResponse, AiError> {
        let chain: Vec<&String> = self
            .routes
            .chain(request.request_type)
            .iter()
            .filter(|name| self.providers.contains_key(name.as_str()))
            .collect();
        if chain.is_empty() {
            return Err(AiError::NoProviderConfigured);
        }

        let started = self.clock.now();
        let mut total_attempts = 0u32;
        let mut last_error: Option<(String, ProviderError)> = None;

        'chain: for (position, name) in chain.iter().enumerate() {
            let provider = &self.providers[name.as_str()];
            if position > 0 {
                self.metrics.record_fallback();
                warn!(
                    request_id = %request.id,
                    from = %chain[position - 1],
                    to = %name,
                    "Falling back to next provider"
                );
            }

            for retry in 0..=self.policy.max_retries {
                total_attempts += 1;

                match self.attempt(provider.as_ref(), request, total_attempts, abort).await? {
                    Ok(reply) => {
                        let finished = self.clock.now();
                        self.metrics.record_usage(name, &reply.usage);
                        return Ok(AiResponse {
                            id: Uuid::new_v4(),
                            request_id: request.id,
                            content: reply.content,
                            provider: name.to_string(),
                            model: reply.model,
                            usage: reply.usage,
                            timestamp: finished,
                            processing_time_ms: elapsed_ms(started, finished),
                        });
                    }
                    Err(err) if !err.is_retryable() => {
                        warn!(
                            request_id = %request.id,
                            provider = %name,
                            attempt = total_attempts,
                            error = %err,
                            "Provider returned fatal error"
                        );
                        return Err(err.into_ai_error(name, total_attempts));
                    }
                    Err(err) => {
                        let delay = match &err {
                            ProviderError::RateLimited {
                                retry_after: Some(wait),
                            } => *wait,
                            _ => self.policy.backoff(retry),
                        };
                        let exhausted = retry == self.policy.max_retries;
                        // A long provider reset is only worth skipping when
                        // someone else can serve the request.
                        let skip_ahead =
                            delay > self.policy.max_delay && position + 1 < chain.len();
                        last_error = Some((name.to_string(), err));

                        if total_attempts >= self.policy.max_total_attempts {
                            warn!(
                                request_id = %request.id,
                                attempts = total_attempts,
                                "Attempt budget exhausted"
                            );
                            break 'chain;
                        }
                        if exhausted || skip_ahead {
                            break;
                        }

                        self.metrics.record_retry();
                        debug!(
                            request_id = %request.id,
                            provider = %name,
                            attempt = total_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying after backoff"
                        );
                        tokio::select! {
                            _ = self.clock.sleep(delay) => {}
                            _ = abort.cancelled() => return Err(AiError::Cancelled),
                        }
                    }
                }
            }
        }

        Err(match last_error {
            Some((provider, err)) => err.into_ai_error(&provider, total_attempts),
            None => AiError::NoProviderConfigured,
        })
    }

    /// One bounded call. The outer `Result` is cancellation, the inner one
    /// is the provider's classified outcome.
    async fn attempt(
        &self,
        provider: &dyn ProviderClient,
        request: &AiRequest,
        attempt: u32,
        abort: &CancellationToken,
    ) -> Result<Result<ProviderReply, ProviderError>, AiError> {
        let name = provider.name();
        let _provider_permit = tokio::select! {
            permit = self.limiter.acquire_provider(name) => permit?,
            _ = abort.cancelled() => return Err(AiError::Cancelled),
        };

        info!(
            request_id = %request.id,
            provider = %name,
            request_type = %request.request_type,
            attempt,
            "Provider request sent"
        );
        let sent = self.clock.now();
        let call = tokio::time::timeout(
            self.timeout,
            provider.call(&request.prompt, &request.context, self.timeout),
        );
        let result = tokio::select! {
            result = call => result.unwrap_or(Err(ProviderError::Timeout)),
            _ = abort.cancelled() => return Err(AiError::Cancelled),
        };
        let finished = self.clock.now();
        let latency_ms = elapsed_ms(sent, finished);

        match &result {
            Ok(reply) => {
                info!(
                    request_id = %request.id,
                    provider = %name,
                    attempt,
                    duration_ms = latency_ms,
                    response_chars = reply.content.chars().count(),
                    "Provider response received"
                );
                self.metrics
                    .record_attempt(name, AttemptOutcome::Success, latency_ms, None, finished);
            }
            Err(err) => {
                warn!(
                    request_id = %request.id,
                    provider = %name,
                    attempt,
                    duration_ms = latency_ms,
                    kind = err.kind(),
                    error = %err,
                    "Provider request failed"
                );
                let outcome = if matches!(err, ProviderError::Timeout) {
                    AttemptOutcome::Timeout
                } else {
                    AttemptOutcome::Failure
                };
                self.metrics
                    .record_attempt(name, outcome, latency_ms, Some(err.to_string()), finished);
            }
        }
        Ok(result)
    }
}
