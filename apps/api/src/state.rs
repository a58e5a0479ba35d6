use crate::ai_queue::AiRequestQueue;
use crate::config::Config;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// The only path to AI providers. Cloning shares the same queue.
    pub queue: AiRequestQueue,
    pub config: Config,
}
