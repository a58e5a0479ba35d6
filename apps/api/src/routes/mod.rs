pub mod ai;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/ai/requests", post(ai::handle_submit))
        .route("/api/v1/ai/status", get(ai::handle_status))
        .route("/api/v1/ai/providers", get(ai::handle_providers))
        .route("/api/v1/ai/rate-limit/:user_id", get(ai::handle_rate_limit))
        .with_state(state)
}
