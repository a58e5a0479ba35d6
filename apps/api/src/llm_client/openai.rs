//! OpenAI Chat Completions client, used as the fallback provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    build_http_client, error_from_response, error_from_transport, render_prompt, Pricing,
    SYSTEM_PROMPT,
};
use crate::ai_queue::{ProviderClient, ProviderError, ProviderReply};

pub const OPENAI_PROVIDER: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    pricing: Pricing,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client()?,
            api_key,
            pricing: Pricing::for_model(&model),
            model,
            base_url: OPENAI_API_URL.to_string(),
        })
    }

    /// Overrides the endpoint (for testing with wiremock).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ProviderClient for OpenAiProvider {
    fn name(&self) -> &str {
        OPENAI_PROVIDER
    }

    async fn call(
        &self,
        prompt: &str,
        context: &Value,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let content = render_prompt(prompt, context);
        let request_body = ChatCompletionRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &content,
                },
            ],
        };

        let response = self
            .client
            .post(&self.base_url)
            .timeout(timeout)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(error_from_transport)?;

        let status = response.status();
        debug!(status = %status, provider = OPENAI_PROVIDER, "Provider HTTP response received");
        if !status.is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Unavailable(format!("malformed response: {e}"))
            }
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProviderError::Unavailable("response had no message content".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(ProviderReply {
            content: text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage: self
                .pricing
                .usage(usage.prompt_tokens, usage.completion_tokens),
        })
    }
}
