use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::ai_queue::error::ProviderError;
use crate::ai_queue::types::Usage;

/// What a provider hands back for one successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

/// One external generative-AI provider.
///
/// Implementations classify their own failures into `ProviderError`; the
/// dispatcher relies on that classification alone.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable identifier, reported as `AiResponse::provider`.
    fn name(&self) -> &str;

    async fn call(
        &self,
        prompt: &str,
        context: &Value,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError>;
}
