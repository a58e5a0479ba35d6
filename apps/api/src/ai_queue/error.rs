use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Whether the dispatcher may try again after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Failure reported by a `ProviderClient`.
///
/// Classification happens where the provider's response is understood
/// (status codes, structured error codes), never downstream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("account quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Timeout
            | ProviderError::Unavailable(_)
            | ProviderError::RateLimited { .. } => ErrorClass::Retryable,
            ProviderError::Authentication(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::QuotaExceeded(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "timeout",
            ProviderError::Unavailable(_) => "unavailable",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Authentication(_) => "authentication",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::QuotaExceeded(_) => "quota_exceeded",
        }
    }

    /// Lift into the caller-facing taxonomy, attaching the provider and attempt count.
    pub fn into_ai_error(self, provider: &str, attempts: u32) -> AiError {
        let provider = provider.to_string();
        match self {
            ProviderError::Timeout => AiError::Timeout { provider, attempts },
            ProviderError::Unavailable(message) => AiError::ProviderUnavailable {
                provider,
                attempts,
                message,
            },
            ProviderError::RateLimited { retry_after } => AiError::ProviderRateLimited {
                provider,
                attempts,
                retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            },
            ProviderError::Authentication(message) => AiError::Authentication {
                provider,
                attempts,
                message,
            },
            ProviderError::InvalidRequest(message) => AiError::InvalidRequest {
                provider,
                attempts,
                message,
            },
            ProviderError::QuotaExceeded(message) => AiError::QuotaExceeded {
                provider,
                attempts,
                message,
            },
        }
    }
}

/// Every way a submitted request can fail. A failed request always
/// resolves to one of these, never to an empty success.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("rate limit exceeded for user {user_id} ({limit} requests per window), resets at {reset_time}")]
    RateLimited {
        user_id: String,
        limit: u32,
        reset_time: DateTime<Utc>,
        /// Time left in the window when the request was rejected, by the queue clock.
        retry_after_ms: u64,
    },

    #[error("provider {provider} unavailable after {attempts} attempt(s): {message}")]
    ProviderUnavailable {
        provider: String,
        attempts: u32,
        message: String,
    },

    #[error("provider {provider} rate limited the request after {attempts} attempt(s)")]
    ProviderRateLimited {
        provider: String,
        attempts: u32,
        retry_after_ms: Option<u64>,
    },

    #[error("authentication with provider {provider} failed: {message}")]
    Authentication {
        provider: String,
        attempts: u32,
        message: String,
    },

    #[error("provider {provider} timed out after {attempts} attempt(s)")]
    Timeout { provider: String, attempts: u32 },

    #[error("provider {provider} account quota exceeded: {message}")]
    QuotaExceeded {
        provider: String,
        attempts: u32,
        message: String,
    },

    #[error("provider {provider} rejected the request: {message}")]
    InvalidRequest {
        provider: String,
        attempts: u32,
        message: String,
    },

    #[error("no provider configured for this request type")]
    NoProviderConfigured,

    #[error("request queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    #[error("request queue is shutting down")]
    ShuttingDown,

    #[error("request was cancelled")]
    Cancelled,
}

impl AiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AiError::ProviderUnavailable { .. }
            | AiError::ProviderRateLimited { .. }
            | AiError::Timeout { .. } => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    /// The instant a per-user rate limit lifts, if this is one.
    pub fn reset_time(&self) -> Option<DateTime<Utc>> {
        match self {
            AiError::RateLimited { reset_time, .. } => Some(*reset_time),
            _ => None,
        }
    }

    /// How long a caller should wait before trying again, when known.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AiError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            AiError::ProviderRateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            AiError::ProviderUnavailable { provider, .. }
            | AiError::ProviderRateLimited { provider, .. }
            | AiError::Authentication { provider, .. }
            | AiError::Timeout { provider, .. }
            | AiError::QuotaExceeded { provider, .. }
            | AiError::InvalidRequest { provider, .. } => Some(provider),
            _ => None,
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            AiError::ProviderUnavailable { attempts, .. }
            | AiError::ProviderRateLimited { attempts, .. }
            | AiError::Authentication { attempts, .. }
            | AiError::Timeout { attempts, .. }
            | AiError::QuotaExceeded { attempts, .. }
            | AiError::InvalidRequest { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
