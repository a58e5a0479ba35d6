use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::ai_queue::AiError;

/// Client closed request; nginx convention for a caller that went away.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Ai(#[from] AiError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

struct ErrorParts {
    status: StatusCode,
    code: &'static str,
    message: String,
    extra: Map<String, Value>,
    retry_after_secs: Option<u64>,
}

impl ErrorParts {
    fn new(status: StatusCode, code: &'static str, message: String) -> Self {
        Self {
            status,
            code,
            message,
            extra: Map::new(),
            retry_after_secs: None,
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

fn ai_error_parts(err: &AiError) -> ErrorParts {
    let message = err.to_string();
    let mut parts = match err {
        AiError::Validation(msg) => ErrorParts::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        AiError::InvalidRequest { .. } => {
            ErrorParts::new(StatusCode::BAD_REQUEST, "PROVIDER_REJECTED_REQUEST", message)
        }
        AiError::RateLimited { limit, .. } => {
            ErrorParts::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
                .with("reset_time", json!(err.reset_time()))
                .with("limit", json!(limit))
        }
        AiError::Cancelled => ErrorParts::new(
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST),
            "CANCELLED",
            message,
        ),
        AiError::ProviderUnavailable { .. } => {
            ErrorParts::new(StatusCode::BAD_GATEWAY, "PROVIDER_UNAVAILABLE", message)
        }
        AiError::Authentication { .. } => {
            tracing::error!("Provider authentication failed: {err}");
            ErrorParts::new(
                StatusCode::BAD_GATEWAY,
                "PROVIDER_AUTHENTICATION_FAILED",
                "The AI provider rejected our credentials".to_string(),
            )
        }
        AiError::QuotaExceeded { .. } => {
            tracing::error!("Provider quota exhausted: {err}");
            ErrorParts::new(StatusCode::BAD_GATEWAY, "PROVIDER_QUOTA_EXCEEDED", message)
        }
        AiError::ProviderRateLimited { .. } => {
            ErrorParts::new(StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_RATE_LIMITED", message)
        }
        AiError::QueueFull { .. } => ErrorParts::new(StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL", message),
        AiError::ShuttingDown => ErrorParts::new(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", message),
        AiError::NoProviderConfigured => {
            tracing::error!("No provider configured: {err}");
            ErrorParts::new(StatusCode::SERVICE_UNAVAILABLE, "NO_PROVIDER_CONFIGURED", message)
        }
        AiError::Timeout { .. } => ErrorParts::new(StatusCode::GATEWAY_TIMEOUT, "PROVIDER_TIMEOUT", message),
    };

    parts.retry_after_secs = err.retry_after_ms().map(|ms| ms.div_ceil(1000).max(1));
    if let Some(provider) = err.provider() {
        parts = parts.with("provider", json!(provider));
    }
    if let Some(attempts) = err.attempts() {
        parts = parts.with("attempts", json!(attempts));
    }
    parts
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let parts = match &self {
            AppError::Validation(msg) => {
                ErrorParts::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Unauthorized => ErrorParts::new(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
            ),
            AppError::Ai(err) => ai_error_parts(err),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                ErrorParts::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let mut error = Map::new();
        error.insert("code".to_string(), json!(parts.code));
        error.insert("message".to_string(), json!(parts.message));
        error.extend(parts.extra);

        let mut response = (parts.status, Json(json!({ "error": error }))).into_response();
        if let Some(secs) = parts.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after_and_reset_time() {
        let reset_time = Utc::now() + ChronoDuration::seconds(30);
        let response = AppError::from(AiError::RateLimited {
            user_id: "u1".into(),
            limit: 5,
            reset_time,
            retry_after_ms: 29_200,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(retry_after, 30);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
        assert_eq!(body["error"]["limit"], 5);
        assert!(body["error"]["reset_time"].is_string());
    }

    #[tokio::test]
    async fn test_provider_errors_map_to_gateway_statuses() {
        let timeout = AppError::from(AiError::Timeout {
            provider: "anthropic".into(),
            attempts: 3,
        })
        .into_response();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = body_json(timeout).await;
        assert_eq!(body["error"]["provider"], "anthropic");
        assert_eq!(body["error"]["attempts"], 3);

        let unavailable = AppError::from(AiError::ProviderUnavailable {
            provider: "openai".into(),
            attempts: 2,
            message: "status 503".into(),
        })
        .into_response();
        assert_eq!(unavailable.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_queue_errors_map_to_service_unavailable() {
        for err in [AiError::QueueFull { capacity: 10 }, AiError::ShuttingDown] {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        let cancelled = AppError::from(AiError::Cancelled).into_response();
        assert_eq!(cancelled.status().as_u16(), 499);
    }

    #[tokio::test]
    async fn test_validation_error_body_shape() {
        let response = AppError::from(AiError::Validation("prompt cannot be empty".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(
            body,
            json!({"error": {"code": "VALIDATION_ERROR", "message": "prompt cannot be empty"}})
        );
    }
}
