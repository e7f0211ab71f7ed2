//! Language model abstraction and implementations.
//!
//! Defines the [`LanguageModel`] trait and concrete implementations:
//! - **[`DisabledModel`]** — always errors; used when no provider is configured.
//! - **[`OpenAiChat`]** — calls an OpenAI-compatible `/chat/completions`
//!   endpoint, either as a single completion or as a token stream.
//!
//! Two model tiers are in play. [`ModelTier::Router`] is the fast, cheap model
//! that classifies questions; [`ModelTier::Answer`] writes SQL and answers.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use data_concierge::config::LlmConfig;
//! # use data_concierge::llm::create_model;
//! let mut config = LlmConfig::default();
//! config.provider = "disabled".to_string();
//! let model = create_model(&config).unwrap();
//! assert!(!model.is_available());
//! ```
//!
//! There is no automatic retry: a failed call surfaces immediately and the
//! caller degrades to its fallback.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::LlmConfig;

/// Incremental answer text. Ends after the last fragment or the first error.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Router,
    Answer,
}

/// One chat request: optional system instruction plus a single user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub tier: ModelTier,
    pub system: Option<String>,
    pub prompt: String,
}

impl ChatRequest {
    pub fn new(tier: ModelTier, prompt: impl Into<String>) -> Self {
        Self {
            tier,
            system: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Whether calls can succeed at all (credentials and provider present).
    fn is_available(&self) -> bool;

    /// Model identifier used for `tier`.
    fn model_name(&self, tier: ModelTier) -> &str;

    /// Full completion text.
    async fn complete(&self, request: ChatRequest) -> Result<String>;

    /// Completion delivered as fragments.
    async fn stream(&self, request: ChatRequest) -> Result<TokenStream>;
}

/// Build the model named by `config.provider`.
///
/// # Errors
///
/// `"openai"` without `OPENAI_API_KEY` in the environment, or an unknown
/// provider name.
pub fn create_model(config: &LlmConfig) -> Result<Box<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledModel)),
        "openai" => Ok(Box::new(OpenAiChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

// ============ Disabled Model ============

/// Stand-in used when `llm.provider = "disabled"` or credentials are missing.
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn is_available(&self) -> bool {
        false
    }

    fn model_name(&self, _tier: ModelTier) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: ChatRequest) -> Result<String> {
        bail!("Language model is disabled")
    }

    async fn stream(&self, _request: ChatRequest) -> Result<TokenStream> {
        bail!("Language model is disabled")
    }
}

// ============ OpenAI-compatible Chat ============

/// Chat model behind an OpenAI-compatible API.
///
/// Requires `OPENAI_API_KEY`. `base_url` may point at any compatible server
/// (Azure OpenAI, vLLM, Ollama's `/v1`).
pub struct OpenAiChat {
    base_url: String,
    router_model: String,
    answer_model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            router_model: config.router_model.clone(),
            answer_model: config.answer_model.clone(),
            api_key,
            client,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        serde_json::json!({
            "model": self.model_name(request.tier),
            "messages": messages,
            "stream": stream,
        })
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = self.model_name(request.tier), stream, "chat request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.body(request, stream))
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, body_text);
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn is_available(&self) -> bool {
        true
    }

    fn model_name(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Router => &self.router_model,
            ModelTier::Answer => &self.answer_model,
        }
    }

    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let response = self.send(&request, false).await?;
        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }

    async fn stream(&self, request: ChatRequest) -> Result<TokenStream> {
        let response = self.send(&request, true).await?;
        let mut bytes = response.bytes_stream();
        let (tx, rx) = mpsc::channel::<Result<String>>(64);

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    match parse_stream_line(line.trim()) {
                        StreamLine::Token(token) => {
                            if tx.send(Ok(token)).await.is_err() {
                                return;
                            }
                        }
                        StreamLine::Done => return,
                        StreamLine::Skip => {}
                        StreamLine::Error(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Extract `choices[0].message.content`.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

enum StreamLine {
    Token(String),
    Done,
    Skip,
    Error(anyhow::Error),
}

/// Interpret one line of an SSE chat-completions stream.
fn parse_stream_line(line: &str) -> StreamLine {
    let Some(data) = line.strip_prefix("data:") else {
        return StreamLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return StreamLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => match chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
        {
            Some(token) if !token.is_empty() => StreamLine::Token(token),
            _ => StreamLine::Skip,
        },
        Err(e) => {
            warn!(error = %e, "undecodable stream chunk");
            StreamLine::Error(anyhow!("Invalid stream chunk: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_content_is_extracted() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "SELECT 1" } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "SELECT 1");
        assert!(parse_completion(&serde_json::json!({ "choices": [] })).is_err());
    }

    #[test]
    fn stream_lines_are_classified() {
        let token = r#"data: {"choices":[{"delta":{"content":"ARR"}}]}"#;
        assert!(matches!(parse_stream_line(token), StreamLine::Token(t) if t == "ARR"));
        assert!(matches!(parse_stream_line("data: [DONE]"), StreamLine::Done));
        assert!(matches!(parse_stream_line(""), StreamLine::Skip));
        assert!(matches!(parse_stream_line(": keep-alive"), StreamLine::Skip));

        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(matches!(parse_stream_line(role_only), StreamLine::Skip));
        assert!(matches!(parse_stream_line("data: {oops"), StreamLine::Error(_)));
    }

    #[test]
    fn request_body_carries_tier_model_and_system() {
        let config = LlmConfig::default();
        let chat = OpenAiChat::with_api_key(&config, "sk-test".to_string()).unwrap();
        let request = ChatRequest::new(ModelTier::Router, "route this").with_system("be brief");
        let body = chat.body(&request, true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "route this");
    }

    #[tokio::test]
    async fn disabled_model_refuses_calls() {
        let model = DisabledModel;
        assert!(!model.is_available());
        let request = ChatRequest::new(ModelTier::Answer, "hi");
        assert!(model.complete(request.clone()).await.is_err());
        assert!(model.stream(request).await.is_err());
    }
}
