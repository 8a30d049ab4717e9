//! Speech-to-text over OpenAI-compatible transcription endpoints.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use parley_core::config::RecognitionConfig;

use crate::audio;

/// One recognized span of speech.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub text: String,
    /// Seconds from the start of the submitted audio.
    pub start: f32,
    pub end: f32,
    /// 0.0..=1.0
    pub confidence: f32,
}

/// Speech recognition collaborator.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe mono `[-1, 1]` samples at `sample_rate` into ordered segments.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<TranscriptSegment>>;
}

/// Join segment texts with a single space and trim the result.
pub fn join_segments(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// Default API base for a recognition provider.
pub fn provider_base_url(provider: &str) -> &'static str {
    match provider {
        "groq" => "https://api.groq.com/openai/v1",
        _ => "https://api.openai.com/v1",
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    text: String,
    #[serde(default)]
    start: f32,
    #[serde(default)]
    end: f32,
    #[serde(default)]
    avg_logprob: Option<f32>,
}

impl VerboseTranscription {
    fn into_segments(self) -> Vec<TranscriptSegment> {
        if self.segments.is_empty() {
            if self.text.trim().is_empty() {
                return Vec::new();
            }
            return vec![TranscriptSegment {
                text: self.text,
                start: 0.0,
                end: 0.0,
                confidence: 1.0,
            }];
        }
        self.segments
            .into_iter()
            .map(|s| TranscriptSegment {
                text: s.text,
                start: s.start,
                end: s.end,
                confidence: s
                    .avg_logprob
                    .map(|lp| lp.exp().clamp(0.0, 1.0))
                    .unwrap_or(1.0),
            })
            .collect()
    }
}

/// Whisper-style recognizer posting WAV audio to `<base>/audio/transcriptions`.
pub struct WhisperHttpRecognizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    language: Option<String>,
}

impl WhisperHttpRecognizer {
    pub fn new(api_key: String, base_url: String, model: String, language: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            language,
        }
    }

    pub fn from_config(config: &RecognitionConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No recognition API key configured"))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| provider_base_url(&config.provider).to_string());
        Ok(Self::new(
            api_key,
            base_url,
            config.model.clone(),
            config.language.clone(),
        ))
    }

    pub fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url)
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperHttpRecognizer {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<TranscriptSegment>> {
        let pcm = audio::quantize(samples);
        let wav_data = audio::encode_wav(&pcm, sample_rate, 1);
        let url = self.endpoint();

        debug!(url, model = %self.model, wav_bytes = wav_data.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let body: VerboseTranscription = resp.json().await?;
        Ok(body.into_segments())
    }
}
