use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ai_queue::error::AiError;

/// Longest prompt accepted by the queue, in characters.
pub const MAX_PROMPT_CHARS: usize = 32_000;

/// The AI features of the product that go through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiRequestType {
    ContentGeneration,
    Analysis,
    Scoring,
    JobMatch,
}

impl AiRequestType {
    pub const ALL: [AiRequestType; 4] = [
        AiRequestType::ContentGeneration,
        AiRequestType::Analysis,
        AiRequestType::Scoring,
        AiRequestType::JobMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AiRequestType::ContentGeneration => "content_generation",
            AiRequestType::Analysis => "analysis",
            AiRequestType::Scoring => "scoring",
            AiRequestType::JobMatch => "job_match",
        }
    }
}

impl fmt::Display for AiRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority lane. Higher lanes are always dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A request for AI work. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub id: Uuid,
    pub request_type: AiRequestType,
    pub prompt: String,
    /// Opaque structured data forwarded to the provider (resume sections, JD, ...).
    pub context: Value,
    pub user_id: String,
    pub priority: Priority,
    /// Restamped from the queue clock when the request is submitted.
    pub submitted_at: DateTime<Utc>,
}

impl AiRequest {
    pub fn new(
        request_type: AiRequestType,
        prompt: impl Into<String>,
        context: Value,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_type,
            prompt: prompt.into(),
            context,
            user_id: user_id.into(),
            priority: Priority::Normal,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Shape check performed before the request is admitted.
    pub fn validate(&self) -> Result<(), AiError> {
        if self.user_id.trim().is_empty() {
            return Err(AiError::Validation("user_id cannot be empty".to_string()));
        }
        if self.prompt.trim().is_empty() {
            return Err(AiError::Validation("prompt cannot be empty".to_string()));
        }
        let chars = self.prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            return Err(AiError::Validation(format!(
                "prompt is {chars} characters, maximum is {MAX_PROMPT_CHARS}"
            )));
        }
        if !(self.context.is_object() || self.context.is_null()) {
            return Err(AiError::Validation(
                "context must be a JSON object or null".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

/// The outcome of one successful provider call, as delivered to a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub id: Uuid,
    pub request_id: Uuid,
    pub content: String,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
}

impl AiResponse {
    /// Copy of this response addressed to another request that shared the work.
    pub fn for_request(&self, request_id: Uuid) -> Self {
        Self {
            request_id,
            ..self.clone()
        }
    }
}

/// Snapshot of the queue lifecycle counters.
///
/// `pending + processing + completed + failed == total_submitted` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_processed: u64,
    pub total_submitted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub requests_remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub is_limited: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_validate_rejects_empty_prompt() {
        let request = AiRequest::new(AiRequestType::Analysis, "   ", Value::Null, "u1");
        assert!(matches!(request.validate(), Err(AiError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_missing_user() {
        let request = AiRequest::new(AiRequestType::Analysis, "score this", Value::Null, "");
        assert!(matches!(request.validate(), Err(AiError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_scalar_context() {
        let request = AiRequest::new(AiRequestType::Scoring, "score", json!(42), "u1");
        assert!(matches!(request.validate(), Err(AiError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_prompt() {
        let prompt = "a".repeat(MAX_PROMPT_CHARS + 1);
        let request = AiRequest::new(AiRequestType::JobMatch, prompt, Value::Null, "u1");
        assert!(matches!(request.validate(), Err(AiError::Validation(_))));
    }

    #[test]
    fn test_validate_accepts_object_context() {
        let request = AiRequest::new(
            AiRequestType::ContentGeneration,
            "Rewrite this bullet",
            json!({"bullet": "Built a cache"}),
            "u1",
        )
        .with_priority(Priority::High);
        assert!(request.validate().is_ok());
        assert_eq!(request.priority, Priority::High);
    }

    #[test]
    fn test_for_request_keeps_shared_fields() {
        let response = AiResponse {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            content: "ok".to_string(),
            provider: "anthropic".to_string(),
            model: "m".to_string(),
            usage: Usage::default(),
            timestamp: Utc::now(),
            processing_time_ms: 12,
        };
        let other = Uuid::new_v4();
        let copy = response.for_request(other);
        assert_eq!(copy.request_id, other);
        assert_eq!(copy.id, response.id);
        assert_eq!(copy.content, response.content);
    }

    #[test]
    fn test_request_type_serializes_snake_case() {
        let value = serde_json::to_value(AiRequestType::JobMatch).unwrap();
        assert_eq!(value, json!("job_match"));
        assert_eq!(AiRequestType::ContentGeneration.to_string(), "content_generation");
    }
}
