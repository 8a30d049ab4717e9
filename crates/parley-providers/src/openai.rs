//! Reply generation over the `chat/completions` wire format.
//!
//! One non-streaming request per turn. OpenRouter and Ollama speak the same
//! format and differ only in base URL and headers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{ChatMessage, Completion, CompletionRequest, Credentials, LlmProvider, Usage};

// Versioned API roots; requests append the endpoint path only.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// API flavor; decides auth and extra headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    credentials: Credentials,
    client: reqwest::Client,
}

impl OpenAiProvider {
    fn with_style(
        base_url: &str,
        api_style: ApiStyle,
        provider_id: &str,
        credentials: Credentials,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_style,
            provider_id: provider_id.into(),
            credentials,
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>, credentials: Credentials) -> Self {
        Self::with_style(
            base_url.unwrap_or(OPENAI_BASE_URL),
            ApiStyle::OpenAi,
            "openai",
            credentials,
        )
    }

    pub fn openrouter(base_url: Option<&str>, credentials: Credentials) -> Self {
        Self::with_style(
            base_url.unwrap_or(OPENROUTER_BASE_URL),
            ApiStyle::OpenRouter,
            "openrouter",
            credentials,
        )
    }

    pub fn ollama(base_url: Option<&str>, credentials: Credentials) -> Self {
        Self::with_style(
            base_url.unwrap_or(OLLAMA_BASE_URL),
            ApiStyle::Ollama,
            "ollama",
            credentials,
        )
    }

    fn request_body(request: &CompletionRequest) -> OpenAiRequest<'_> {
        OpenAiRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            stream: false,
            temperature: request.temperature,
        }
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ChatCompletion {
    fn into_completion(self) -> anyhow::Result<Completion> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("completion has no choices"))?;
        let text = choice.message.content.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            anyhow::bail!("completion returned empty content");
        }
        Ok(Completion {
            text,
            finish_reason: choice.finish_reason,
            usage: self.usage.map(|u| Usage {
                input_tokens: Some(u.prompt_tokens),
                output_tokens: Some(u.completion_tokens),
            }),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        let body = Self::request_body(request);

        debug!(model = %body.model, base_url = %self.base_url, messages = body.messages.len(), "Calling OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("content-type", "application/json");

        // Auth differs by style
        match (&self.credentials, self.api_style) {
            (_, ApiStyle::Ollama) => {}
            (Credentials::ApiKey { api_key }, _) => {
                req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
            }
            (Credentials::None, _) => {
                anyhow::bail!("{} requires ApiKey credentials", self.provider_id)
            }
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("X-Title", "parley");
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        let completion: ChatCompletion = response.json().await?;
        let completion = completion.into_completion()?;
        trace!(finish_reason = ?completion.finish_reason, chars = completion.text.len(), "Completion received");
        Ok(completion)
    }
}
