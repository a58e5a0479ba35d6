//! AI request queue: the single path from the product to generative-AI
//! providers.
//!
//! Submissions pass per-user rate limiting and response deduplication before
//! they are queued by priority. Workers dispatch under a global concurrency
//! ceiling, and the dispatcher walks each request type's provider chain with
//! retries, backoff and fallback.

pub mod cache;
pub mod clock;
pub mod concurrency;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use clock::TokioClock;
pub use dispatcher::{ProviderRoutes, RetryPolicy};
pub use error::{AiError, ProviderError};
pub use provider::{ProviderClient, ProviderReply};
pub use queue::{AiRequestQueue, QueueConfig};
pub use types::{AiRequest, AiRequestType, AiResponse, Priority, RateLimitStatus, Usage};
