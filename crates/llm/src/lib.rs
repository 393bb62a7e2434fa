//! Chat model contract and the OpenAI-compatible HTTP client.
//!
//! Agents talk to a `dyn ChatModel`, never to reqwest directly, so tests can
//! substitute a scripted model.  Responses follow the content-block protocol:
//! a reply is a sequence of typed blocks and agents extract text by
//! concatenating the `text`-typed ones.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use formflow_config::ModelConfig;

// ── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

// ── Response types ───────────────────────────────────────────────────────────

/// A typed block inside a model reply.  Only text blocks exist today; the
/// closed enum keeps downstream extraction total.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Vec<ContentBlock>,
}

impl ChatResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { content: vec![ContentBlock::Text { text: text.into() }] }
    }

    /// Concatenate every text block.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
            })
            .collect()
    }
}

/// Either a complete reply or a stream of text fragments to collate.
pub enum ModelReply {
    Complete(ChatResponse),
    Streamed(mpsc::Receiver<String>),
}

impl ModelReply {
    /// Drain the reply into a single trimmed string.
    pub async fn collate(self) -> String {
        match self {
            ModelReply::Complete(response) => response.text().trim().to_string(),
            ModelReply::Streamed(mut rx) => {
                let mut text = String::new();
                while let Some(fragment) = rx.recv().await {
                    text.push_str(&fragment);
                }
                text.trim().to_string()
            }
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no API key configured for the chat model")]
    MissingApiKey,
    #[error("transport error calling chat model: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat model returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("chat model reply had no content")]
    EmptyReply,
}

impl LlmError {
    /// HTTP-level failures (connection or status) are the retryable class;
    /// configuration and empty-reply failures are not.
    pub fn is_http(&self) -> bool {
        matches!(self, LlmError::Transport(_) | LlmError::Api { .. })
    }
}

// ── Model contract ───────────────────────────────────────────────────────────

#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ModelReply, LlmError>;
}

// ── OpenAI-compatible client ─────────────────────────────────────────────────

/// Client for any `/chat/completions` endpoint (DeepSeek, OpenAI, Kimi,
/// relay gateways).  Streaming uses SSE `data:` lines.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    config: ModelConfig,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(config: ModelConfig) -> Self {
        Self { config, client: reqwest::Client::new() }
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn payload(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        let mut payload = json!({
            "model": self.config.model_name,
            "messages": messages,
            "stream": stream,
        });
        if let Some(effort) = self.config.reasoning_effort {
            payload["reasoning_effort"] = json!(effort.as_str());
        }
        payload
    }

    async fn chat_complete(&self, messages: &[ChatMessage]) -> Result<ModelReply, LlmError> {
        let api_key = self.config.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&self.payload(messages, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), body });
        }

        let body: serde_json::Value = response.json().await?;
        let text = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or(LlmError::EmptyReply)?;

        Ok(ModelReply::Complete(ChatResponse::from_text(text)))
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ModelReply, LlmError> {
        let api_key = self.config.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;
        let mut response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&self.payload(messages, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), body });
        }

        let (tx, rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            // SSE frames may split across chunks; keep a carry buffer and
            // only parse completed lines.
            let mut carry = String::new();
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        carry.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(newline) = carry.find('\n') {
                            let line = carry[..newline].trim().to_string();
                            carry.drain(..=newline);
                            if let Some(delta) = parse_sse_delta(&line) {
                                if tx.send(delta).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "chat stream interrupted");
                        break;
                    }
                }
            }
            if let Some(delta) = parse_sse_delta(carry.trim()) {
                let _ = tx.send(delta).await;
            }
        });

        Ok(ModelReply::Streamed(rx))
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiChatClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ModelReply, LlmError> {
        debug!(
            model = %self.config.model_name,
            messages = messages.len(),
            stream = self.config.stream,
            "chat request"
        );
        if self.config.stream {
            self.chat_stream(messages).await
        } else {
            self.chat_complete(messages).await
        }
    }
}

/// Extract the text delta from one SSE line, if it carries one.
fn parse_sse_delta(line: &str) -> Option<String> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    let delta = value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?;
    if delta.is_empty() { None } else { Some(delta.to_string()) }
}
