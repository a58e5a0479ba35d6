//! LLM Client: HTTP provider implementations behind the AI request queue.
//!
//! ARCHITECTURAL RULE: these clients are only ever called by the queue's
//! dispatcher. Each invocation makes exactly one HTTP call and classifies
//! the outcome. Retries and fallback live in the dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ai_queue::{ProviderClient, ProviderError, ProviderReply, Usage};

pub mod openai;

pub use openai::OpenAiProvider;

pub const ANTHROPIC_PROVIDER: &str = "anthropic";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// Shared system prompt for every resume-authoring request.
pub(crate) const SYSTEM_PROMPT: &str = "You are an expert resume writer and career coach. \
Answer concisely and only with the content requested. Never invent employers, dates, \
credentials or metrics that are not present in the provided context.";

/// Price per million tokens, in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    /// List price for well-known models; unknown models cost nothing.
    pub fn for_model(model: &str) -> Self {
        match model {
            m if m.starts_with("claude-opus") => Self::new(15.0, 75.0),
            m if m.starts_with("claude-sonnet") => Self::new(3.0, 15.0),
            m if m.starts_with("claude-haiku") || m.starts_with("claude-3-5-haiku") => {
                Self::new(0.8, 4.0)
            }
            m if m.starts_with("gpt-4o-mini") => Self::new(0.15, 0.6),
            m if m.starts_with("gpt-4o") => Self::new(2.5, 10.0),
            _ => Self::new(0.0, 0.0),
        }
    }

    pub fn usage(&self, input_tokens: u32, output_tokens: u32) -> Usage {
        let cost_usd = (f64::from(input_tokens) * self.input_per_mtok
            + f64::from(output_tokens) * self.output_per_mtok)
            / 1_000_000.0;
        Usage {
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }
}

/// Appends non-empty request context to the prompt as pretty JSON.
pub(crate) fn render_prompt(prompt: &str, context: &Value) -> String {
    let empty = match context {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        return prompt.to_string();
    }
    let context = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
    format!("{prompt}\n\nContext:\n{context}")
}

/// Error envelope shared by the Anthropic and OpenAI APIs.
#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
    message: String,
}

const QUOTA_ERROR_TYPES: &[&str] = &["billing_error", "insufficient_quota"];

/// `Retry-After` in (possibly fractional) seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Map an HTTP failure onto the retry taxonomy. `quota` is set when the
/// structured error names a billing or quota problem.
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    quota: bool,
    message: String,
) -> ProviderError {
    if quota {
        return ProviderError::QuotaExceeded(message);
    }
    match status.as_u16() {
        401 | 403 => ProviderError::Authentication(message),
        402 => ProviderError::QuotaExceeded(message),
        408 => ProviderError::Timeout,
        429 => ProviderError::RateLimited { retry_after },
        s if s >= 500 => ProviderError::Unavailable(format!("status {s}: {message}")),
        _ => ProviderError::InvalidRequest(message),
    }
}

/// Classify a non-success response, reading the structured error body if any.
async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ApiErrorEnvelope>(&body) {
        Ok(envelope) => {
            let ApiErrorBody {
                error_type,
                code,
                message,
            } = envelope.error;
            let quota = [error_type.as_deref(), code.as_deref()]
                .into_iter()
                .flatten()
                .any(|kind| QUOTA_ERROR_TYPES.contains(&kind));
            classify_status(status, retry_after, quota, message)
        }
        Err(_) => classify_status(status, retry_after, false, body),
    }
}

fn error_from_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

pub(crate) fn build_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicResponse {
    /// Concatenated text of all text blocks.
    fn text(&self) -> Option<String> {
        let text: String = self
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

/// Anthropic Messages API, the primary provider.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    pricing: Pricing,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client()?,
            api_key,
            pricing: Pricing::for_model(&model),
            model,
            base_url: ANTHROPIC_API_URL.to_string(),
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
impl ProviderClient for AnthropicProvider {
    fn name(&self) -> &str {
        ANTHROPIC_PROVIDER
    }

    async fn call(
        &self,
        prompt: &str,
        context: &Value,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let content = render_prompt(prompt, context);
        let request_body = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &content,
            }],
        };

        let response = self
            .client
            .post(&self.base_url)
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(error_from_transport)?;

        let status = response.status();
        debug!(status = %status, provider = ANTHROPIC_PROVIDER, "Provider HTTP response received");
        if !status.is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: AnthropicResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Unavailable(format!("malformed response: {e}"))
            }
        })?;
        let text = parsed
            .text()
            .ok_or_else(|| ProviderError::Unavailable("response had no text content".to_string()))?;

        Ok(ProviderReply {
            content: text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage: self
                .pricing
                .usage(parsed.usage.input_tokens, parsed.usage.output_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn test_provider(base_url: &str) -> AnthropicProvider {
        AnthropicProvider::new("test-api-key".into(), DEFAULT_ANTHROPIC_MODEL.into())
            .unwrap()
            .with_base_url(base_url.to_string())
    }

    fn success_body(text: &str) -> Value {
        json!({
            "id": "msg_test",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "model": "claude-sonnet-4-5-20250929",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1000, "output_tokens": 200}
        })
    }

    async fn respond_with(template: ResponseTemplate) -> Result<ProviderReply, ProviderError> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(template)
            .mount(&server)
            .await;
        test_provider(&server.uri())
            .call("Rewrite my summary", &Value::Null, TIMEOUT)
            .await
    }

    #[tokio::test]
    async fn test_call_success_reports_usage_and_cost() {
        let reply = respond_with(
            ResponseTemplate::new(200).set_body_json(success_body("Seasoned backend engineer")),
        )
        .await
        .unwrap();

        assert_eq!(reply.content, "Seasoned backend engineer");
        assert_eq!(reply.model, "claude-sonnet-4-5-20250929");
        assert_eq!(reply.usage.input_tokens, 1000);
        assert_eq!(reply.usage.output_tokens, 200);
        // 1000 * $3/M + 200 * $15/M
        assert!((reply.usage.cost_usd - 0.006).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_call_sends_headers_and_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("x-api-key", "test-api-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({
                "model": DEFAULT_ANTHROPIC_MODEL,
                "max_tokens": MAX_TOKENS,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let result = test_provider(&server.uri())
            .call("Score this", &json!({"role": "SRE"}), TIMEOUT)
            .await;
        assert!(result.is_ok(), "headers should match: {result:?}");
    }

    #[tokio::test]
    async fn test_429_is_rate_limited_with_retry_after() {
        let err = respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({"error": {"type": "rate_limit_error", "message": "Rate limited"}})),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_401_is_authentication_failure() {
        let err = respond_with(ResponseTemplate::new(401).set_body_json(
            json!({"error": {"type": "authentication_error", "message": "invalid x-api-key"}}),
        ))
        .await
        .unwrap_err();

        assert_eq!(err, ProviderError::Authentication("invalid x-api-key".into()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_400_is_invalid_request() {
        let err = respond_with(ResponseTemplate::new(400).set_body_json(
            json!({"error": {"type": "invalid_request_error", "message": "prompt is too long"}}),
        ))
        .await
        .unwrap_err();

        assert_eq!(err, ProviderError::InvalidRequest("prompt is too long".into()));
    }

    #[tokio::test]
    async fn test_billing_error_is_quota_exceeded() {
        let err = respond_with(ResponseTemplate::new(400).set_body_json(
            json!({"error": {"type": "billing_error", "message": "credit balance is too low"}}),
        ))
        .await
        .unwrap_err();

        assert_eq!(err, ProviderError::QuotaExceeded("credit balance is too low".into()));
    }

    #[tokio::test]
    async fn test_overloaded_is_unavailable() {
        let err = respond_with(ResponseTemplate::new(529).set_body_json(
            json!({"error": {"type": "overloaded_error", "message": "Overloaded"}}),
        ))
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::Unavailable(ref m) if m.contains("529")), "got: {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(success_body("late"))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = test_provider(&server.uri())
            .call("Rewrite", &Value::Null, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let err = test_provider("http://127.0.0.1:1")
            .call("Rewrite", &Value::Null, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_empty_content_is_unavailable() {
        let err = respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [],
            "usage": {"input_tokens": 3, "output_tokens": 0}
        })))
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[test]
    fn test_render_prompt_appends_context() {
        assert_eq!(render_prompt("Hi", &Value::Null), "Hi");
        assert_eq!(render_prompt("Hi", &json!({})), "Hi");
        let rendered = render_prompt("Hi", &json!({"role": "SRE"}));
        assert!(rendered.starts_with("Hi\n\nContext:\n"));
        assert!(rendered.contains("\"role\": \"SRE\""));
    }

    #[test]
    fn test_pricing_for_known_and_unknown_models() {
        assert_eq!(Pricing::for_model("claude-sonnet-4-5"), Pricing::new(3.0, 15.0));
        assert_eq!(Pricing::for_model("gpt-4o-mini"), Pricing::new(0.15, 0.6));
        assert_eq!(Pricing::for_model("local-llama").usage(100, 100).cost_usd, 0.0);
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "1.5".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }
}
