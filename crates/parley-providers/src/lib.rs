//! Reply generation provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait to turn an ordered,
//! role-tagged message list into one reply. The voice pipeline only needs
//! whole replies, so completions are non-streaming.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use parley_core::config::GenerationConfig;
use parley_core::types::{ConversationHistory, Role};

pub mod openai;

pub use openai::OpenAiProvider;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    /// Local providers (Ollama) need no auth.
    #[serde(rename = "none")]
    None,
}

/// One role-tagged chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    /// System message first, then history in order.
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    /// Build a request from system instructions plus the conversation history.
    pub fn from_history(config: &GenerationConfig, history: &ConversationHistory) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !config.instructions.is_empty() {
            messages.push(ChatMessage::new(Role::System, config.instructions.clone()));
        }
        messages.extend(
            history
                .turns()
                .map(|turn| ChatMessage::new(turn.role, turn.text.clone())),
        );
        Self {
            model: config.model.clone(),
            messages,
            max_tokens: config.max_tokens,
            temperature: Some(config.temperature),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// A finished reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Provider finish signal (e.g. "stop", "length").
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "openai", "ollama").
    fn id(&self) -> &str;

    /// Run one chat completion.
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion>;
}

/// Build the provider named by `config.provider`.
pub fn from_config(config: &GenerationConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let credentials = match config.resolve_api_key() {
        Some(api_key) => Credentials::ApiKey { api_key },
        None if config.provider == "ollama" => Credentials::None,
        None => anyhow::bail!(
            "No API key configured for generation provider '{}'",
            config.provider
        ),
    };
    let base_url = config.base_url.as_deref();
    let provider = match config.provider.as_str() {
        "openai" => OpenAiProvider::openai(base_url, credentials),
        "openrouter" => OpenAiProvider::openrouter(base_url, credentials),
        "ollama" => OpenAiProvider::ollama(base_url, credentials),
        other => anyhow::bail!("Unknown generation provider: {other}"),
    };
    Ok(Arc::new(provider))
}
