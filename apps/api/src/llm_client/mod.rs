//! LLM Client: the single point of entry for all model endpoint calls.
//!
//! ARCHITECTURAL RULE: No other module may talk HTTP to the model endpoint.
//! Everything goes through the `ModelEndpoint` trait; `LlmClient` is the production
//! implementation over an OpenAI-compatible chat-completions API.
//!
//! One call here is exactly one attempt. Retries, backoff and rate limiting live in
//! the dispatcher.

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::conversation::Role;

pub mod prompts;

// ────────────────────────────────────────────────────────────────────────────
// Endpoint contract
// ────────────────────────────────────────────────────────────────────────────

/// A vendor-neutral model request: system instructions, ordered turns, optional schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<ModelMessage>,
    pub function: Option<FunctionSchema>,
    pub sampling: Sampling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl ModelMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![MessagePart::Text(text.into())],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    Image { media_type: String, data: Bytes },
}

/// A function the model is asked to call instead of answering in prose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Conversational turns favour responsiveness over length.
pub const CHAT_SAMPLING: Sampling = Sampling {
    temperature: 0.7,
    max_tokens: 800,
};

/// CV drafting is kept close to the input.
pub const GENERATION_SAMPLING: Sampling = Sampling {
    temperature: 0.2,
    max_tokens: 1000,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelReply {
    Text { text: String },
    FunctionCall { name: String, arguments: String },
}

impl ModelReply {
    /// The raw text carried by the reply (the arguments string for function calls).
    pub fn raw_text(&self) -> &str {
        match self {
            ModelReply::Text { text } => text,
            ModelReply::FunctionCall { arguments, .. } => arguments,
        }
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("authentication rejected (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("malformed request (status {status}): {message}")]
    Malformed { status: u16, message: String },

    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("attempt timed out")]
    Timeout,

    #[error("unreadable response body: {0}")]
    Decode(String),
}

/// The external model endpoint. Implemented by `LlmClient` and by test fakes.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn send(&self, request: &ModelRequest) -> Result<ModelReply, EndpointError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Wire types (OpenAI-compatible chat completions)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

/// The production model endpoint client.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        messages.extend(request.messages.iter().map(encode_message));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.sampling.temperature,
            "max_tokens": request.sampling.max_tokens,
        });

        if let Some(function) = &request.function {
            body["tools"] = json!([{
                "type": "function",
                "function": {
                    "name": function.name,
                    "description": function.description,
                    "parameters": function.parameters,
                }
            }]);
            body["tool_choice"] = json!({
                "type": "function",
                "function": {"name": function.name}
            });
        }

        body
    }
}

#[async_trait]
impl ModelEndpoint for LlmClient {
    async fn send(&self, request: &ModelRequest) -> Result<ModelReply, EndpointError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EndpointError::Timeout
                } else {
                    EndpointError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| EndpointError::Decode(e.to_string()))?;

        if let Some(usage) = &completion.usage {
            debug!(
                "Model call succeeded: prompt_tokens={}, completion_tokens={}",
                usage.prompt_tokens, usage.completion_tokens
            );
        }

        reply_from_completion(completion)
    }
}

fn encode_message(message: &ModelMessage) -> Value {
    let content = match message.parts.as_slice() {
        [MessagePart::Text(text)] => Value::String(text.clone()),
        parts => Value::Array(parts.iter().map(encode_part).collect()),
    };
    json!({"role": message.role.as_str(), "content": content})
}

fn encode_part(part: &MessagePart) -> Value {
    match part {
        MessagePart::Text(text) => json!({"type": "text", "text": text}),
        MessagePart::Image { media_type, data } => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(data);
            json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{media_type};base64,{encoded}")}
            })
        }
    }
}

fn reply_from_completion(completion: ChatCompletion) -> Result<ModelReply, EndpointError> {
    let message = completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| EndpointError::Decode("response has no choices".to_string()))?;

    if let Some(call) = message.tool_calls.into_iter().next() {
        return Ok(ModelReply::FunctionCall {
            name: call.function.name,
            arguments: call.function.arguments,
        });
    }

    match message.content {
        Some(text) if !text.trim().is_empty() => Ok(ModelReply::Text { text }),
        _ => Err(EndpointError::Decode("model returned empty content".to_string())),
    }
}

/// Maps a non-2xx status and body onto the endpoint error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> EndpointError {
    let parsed = serde_json::from_str::<ApiError>(body).ok();
    let marker = parsed
        .as_ref()
        .map(|e| {
            format!(
                "{} {}",
                e.error.code.as_deref().unwrap_or_default(),
                e.error.kind.as_deref().unwrap_or_default()
            )
        })
        .unwrap_or_else(|| body.to_string());
    let message = parsed
        .map(|e| e.error.message)
        .unwrap_or_else(|| body.to_string());
    let code = status.as_u16();

    if marker.contains("insufficient_quota") {
        return EndpointError::RateLimited(message);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EndpointError::Auth {
            status: code,
            message,
        },
        StatusCode::TOO_MANY_REQUESTS => EndpointError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT => EndpointError::Timeout,
        s if s.is_server_error() => EndpointError::Server {
            status: code,
            message,
        },
        _ if marker.contains("content_policy") || marker.contains("content_filter") => {
            EndpointError::ContentPolicy(message)
        }
        _ => EndpointError::Malformed {
            status: code,
            message,
        },
    }
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}
