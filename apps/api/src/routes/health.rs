use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns service status; reports "draining" once the queue stops accepting.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let status = if state.queue.is_accepting() {
        "ok"
    } else {
        "draining"
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "service": env!("CARGO_PKG_NAME"),
        "primary_model": state.config.anthropic_model,
        "fallback_enabled": state.config.openai_api_key.is_some()
    }))
}
