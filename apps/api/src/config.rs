use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::ai_queue::cache::CacheConfig;
use crate::ai_queue::rate_limiter::RateLimitConfig;
use crate::ai_queue::{AiRequestType, QueueConfig, RetryPolicy};
use crate::llm_client::openai::DEFAULT_OPENAI_MODEL;
use crate::llm_client::{Pricing, DEFAULT_ANTHROPIC_MODEL};

/// Application configuration loaded from environment variables.
/// Startup fails if a required variable is missing or a value does not parse.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rust_log: String,
    pub anthropic_api_key: String,
    pub anthropic_model: String,
    pub anthropic_pricing: Pricing,
    /// Enables the fallback provider when set.
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_pricing: Pricing,
    /// Provider chains overriding the default order, from `AI_ROUTE_<TYPE>`.
    pub routes: HashMap<AiRequestType, Vec<String>>,
    pub queue: QueueConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = QueueConfig::default();

        let queue = QueueConfig {
            workers: env.parse_or("AI_QUEUE_WORKERS", defaults.workers)?,
            max_concurrent: env.parse_or("AI_MAX_CONCURRENT", defaults.max_concurrent)?,
            max_concurrent_per_provider: env.parse_opt("AI_MAX_CONCURRENT_PER_PROVIDER")?,
            max_queue_size: env.parse_or("AI_MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            rate_limit: RateLimitConfig {
                max_requests: env
                    .parse_or("AI_RATE_LIMIT_REQUESTS", defaults.rate_limit.max_requests)?,
                window: env.secs_or("AI_RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window)?,
            },
            cache: CacheConfig {
                ttl: env.secs_or("AI_CACHE_TTL_SECS", defaults.cache.ttl)?,
                max_entries: env.parse_or("AI_CACHE_MAX_ENTRIES", defaults.cache.max_entries)?,
            },
            retry: RetryPolicy {
                max_retries: env.parse_or("AI_MAX_RETRIES", defaults.retry.max_retries)?,
                base_delay: env.millis_or("AI_RETRY_BASE_MS", defaults.retry.base_delay)?,
                max_delay: env.millis_or("AI_RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
                max_total_attempts: env
                    .parse_or("AI_MAX_TOTAL_ATTEMPTS", defaults.retry.max_total_attempts)?,
                ..defaults.retry
            },
            provider_timeout: env.secs_or("AI_PROVIDER_TIMEOUT_SECS", defaults.provider_timeout)?,
            shutdown_grace: env.secs_or("AI_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
        };

        if queue.workers == 0 || queue.max_concurrent == 0 {
            anyhow::bail!("AI_QUEUE_WORKERS and AI_MAX_CONCURRENT must be at least 1");
        }

        let anthropic_model = env
            .get("ANTHROPIC_MODEL")
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string());
        let openai_model = env
            .get("OPENAI_MODEL")
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());

        let mut routes = HashMap::new();
        for request_type in AiRequestType::ALL {
            if let Some(chain) = env.route(request_type)? {
                routes.insert(request_type, chain);
            }
        }

        Ok(Config {
            port: env
                .parse_or("PORT", 8080u16)
                .context("PORT must be a valid port number")?,
            rust_log: env.get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            anthropic_api_key: env.require("ANTHROPIC_API_KEY")?,
            anthropic_pricing: env.pricing("ANTHROPIC", &anthropic_model)?,
            anthropic_model,
            openai_api_key: env.get("OPENAI_API_KEY"),
            openai_pricing: env.pricing("OPENAI", &openai_model)?,
            openai_model,
            routes,
            queue,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank are the same thing.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("Required environment variable '{key}' is not set"))
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .with_context(|| format!("Environment variable '{key}' has invalid value '{raw}'"))
            })
            .transpose()
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    /// List price for `model`, with `<PREFIX>_{INPUT,OUTPUT}_PRICE_PER_MTOK` overrides.
    fn pricing(&self, prefix: &str, model: &str) -> Result<Pricing> {
        let list = Pricing::for_model(model);
        let input_key = format!("{prefix}_INPUT_PRICE_PER_MTOK");
        let output_key = format!("{prefix}_OUTPUT_PRICE_PER_MTOK");
        let pricing = Pricing::new(
            self.parse_or(&input_key, list.input_per_mtok)?,
            self.parse_or(&output_key, list.output_per_mtok)?,
        );
        for (key, price) in [(input_key, pricing.input_per_mtok), (output_key, pricing.output_per_mtok)] {
            if !price.is_finite() || price < 0.0 {
                anyhow::bail!("Environment variable '{key}' must be a non-negative price");
            }
        }
        Ok(pricing)
    }

    /// `AI_ROUTE_<TYPE>=anthropic,openai`: ordered provider names for one request type.
    fn route(&self, request_type: AiRequestType) -> Result<Option<Vec<String>>> {
        let key = format!("AI_ROUTE_{}", request_type.as_str().to_ascii_uppercase());
        let Some(raw) = self.get(&key) else {
            return Ok(None);
        };
        let chain: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if chain.is_empty() {
            anyhow::bail!("Environment variable '{key}' must list at least one provider");
        }
        Ok(Some(chain))
    }
}
