use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::util::strip_code_fences;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("empty completion from model")]
    EmptyCompletion,

    #[error("completion is not valid JSON for the requested schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("invalid API key header")]
    InvalidKey,
}

impl LlmError {
    /// Worth retrying: network failures, timeouts, rate limits, server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// --- Wire types (OpenAI-compatible chat completions) ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

const MAX_OUTPUT_TOKENS: u32 = 1024;

/// Chat client for any OpenAI-compatible completions endpoint.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    model: String,
    endpoint: String,
    http: reqwest::Client,
}

impl LlmClient {
    /// `endpoint` is the full chat completions URL
    /// (e.g. "https://api.siliconflow.cn/v1/chat/completions").
    pub fn new(api_key: &str, model: &str, endpoint: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            endpoint: endpoint.to_string(),
            http,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| LlmError::InvalidKey)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Plain completion: system + user prompt in, assistant text out.
    pub async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                WireMessage { role: "system", content: system_prompt },
                WireMessage { role: "user", content: user_prompt },
            ],
            max_tokens: MAX_OUTPUT_TOKENS,
        };

        debug!(model = %self.model, "chat completion request");

        let response = self
            .http
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyCompletion)
    }

    /// Schema-driven extraction: the response type's JSON schema is appended
    /// to the system prompt and the completion is parsed into it. Code fences
    /// around the JSON are tolerated.
    pub async fn extract<T: JsonSchema + DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T, LlmError> {
        let schema = schema_for!(T);
        let schema_json = serde_json::to_string_pretty(&schema)?;
        let system = format!(
            "{system_prompt}\n\nRespond with a single JSON object matching this JSON schema, \
             with no prose before or after it:\n{schema_json}"
        );

        let completion = self.chat(&system, user_prompt).await?;
        let json = strip_code_fences(&completion);
        Ok(serde_json::from_str(json)?)
    }
}
