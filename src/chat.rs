//! Chat-completion collaborator client for LLM interactions.

use crate::config::ApiKey;
use crate::error::UpstreamError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One request to the chat collaborator.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Collaborator reply: the assistant's text plus the verbatim payload for
/// debug mode.
#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub content: String,
    pub raw: serde_json::Value,
}

/// Async trait implemented by the chat backend; stubbed in tests.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatOutput, UpstreamError>;
}

/// HTTP client for a chat-completions endpoint.
pub struct HttpChatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: ApiKey,
}

impl HttpChatClient {
    pub fn new(client: reqwest::Client, base_url: String, model: String, api_key: ApiKey) -> Self {
        Self {
            client,
            base_url,
            model,
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for HttpChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatOutput, UpstreamError> {
        let key = self.api_key.resolve().await?;

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: Some(request.max_tokens),
        };

        debug!("HttpChatClient: sending request, model={}", body.model);

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_response(status, text));
        }

        let raw: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let parsed: ChatCompletionResponse = serde_json::from_value(raw.clone())
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        if let Some(usage) = &parsed.usage {
            info!(
                "HttpChatClient: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ChatOutput { content, raw })
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

// ============================================================================
// Test doubles
// ============================================================================

/// Pops one scripted reply per call; errors once the script runs out.
#[cfg(test)]
pub struct ScriptedChat {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, UpstreamError>>>,
}

#[cfg(test)]
impl ScriptedChat {
    pub fn new(responses: Vec<Result<String, UpstreamError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn replying(content: &str) -> Self {
        Self::new(vec![Ok(content.to_string())])
    }

    pub fn always_failing() -> Self {
        Self::new(vec![])
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatOutput, UpstreamError> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(content)) => Ok(ChatOutput {
                content,
                raw: serde_json::json!({"stub": true}),
            }),
            Some(Err(e)) => Err(e),
            None => Err(UpstreamError::Http {
                status: 500,
                body: "script exhausted".into(),
            }),
        }
    }
}
