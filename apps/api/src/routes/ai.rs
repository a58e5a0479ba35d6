use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai_queue::metrics::{MetricsSnapshot, ProviderHealth};
use crate::ai_queue::queue::QueueOverview;
use crate::ai_queue::{AiRequest, AiRequestType, AiResponse, Priority, RateLimitStatus};
use crate::errors::AppError;
use crate::state::AppState;

/// Caller identity, set by the authenticating proxy in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub request_type: AiRequestType,
    pub prompt: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    #[serde(flatten)]
    pub overview: QueueOverview,
    pub metrics: MetricsSnapshot,
}

fn user_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(AppError::Unauthorized)
}

/// POST /api/v1/ai/requests
///
/// Holds the connection until the queue resolves the request. A client
/// disconnect drops this future, which withdraws the request.
pub async fn handle_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<AiResponse>, AppError> {
    let user_id = user_id(&headers)?;
    let Json(req) = body.map_err(|rejection| AppError::Validation(rejection.body_text()))?;
    let request = AiRequest::new(req.request_type, req.prompt, req.context, user_id)
        .with_priority(req.priority);
    let response = state.queue.submit(request).await?;
    Ok(Json(response))
}

/// GET /api/v1/ai/status
pub async fn handle_status(State(state): State<AppState>) -> Json<QueueStatusResponse> {
    Json(QueueStatusResponse {
        overview: state.queue.overview(),
        metrics: state.queue.metrics(),
    })
}

/// GET /api/v1/ai/providers
pub async fn handle_providers(State(state): State<AppState>) -> Json<Vec<ProviderHealth>> {
    Json(state.queue.provider_health())
}

/// GET /api/v1/ai/rate-limit/:user_id
pub async fn handle_rate_limit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<RateLimitStatus> {
    Json(state.queue.rate_limit_status(&user_id))
}
