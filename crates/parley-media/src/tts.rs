//! Text-to-speech collaborators returning raw 16-bit PCM.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use parley_core::config::SynthesisConfig;

/// Synthesized mono PCM and its rate.
#[derive(Debug, Clone, Default)]
pub struct SynthesizedAudio {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.pcm.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Speech synthesis collaborator.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;
}

/// Build the synthesizer named by `config.provider`.
pub fn from_config(config: &SynthesisConfig) -> Result<Arc<dyn SpeechSynthesizer>> {
    let api_key = config
        .resolve_api_key()
        .ok_or_else(|| anyhow::anyhow!("No synthesis API key configured"))?;
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiSpeechSynthesizer::new(api_key, config))),
        "elevenlabs" => Ok(Arc::new(ElevenLabsSynthesizer::new(api_key, config))),
        other => anyhow::bail!("Unknown synthesis provider: {other}"),
    }
}

/// Reassembles little-endian i16 samples from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct PcmAccumulator {
    samples: Vec<i16>,
    carry: Option<u8>,
}

impl PcmAccumulator {
    pub fn push(&mut self, mut chunk: &[u8]) {
        if let Some(low) = self.carry.take() {
            match chunk.split_first() {
                Some((&high, rest)) => {
                    self.samples.push(i16::from_le_bytes([low, high]));
                    chunk = rest;
                }
                None => {
                    self.carry = Some(low);
                    return;
                }
            }
        }
        let pairs = chunk.chunks_exact(2);
        self.carry = pairs.remainder().first().copied();
        self.samples
            .extend(pairs.map(|c| i16::from_le_bytes([c[0], c[1]])));
    }

    /// Collected samples; a dangling half sample is dropped.
    pub fn finish(self) -> Vec<i16> {
        self.samples
    }
}

/// OpenAI `audio/speech` with `response_format=pcm` (24 kHz s16le mono).
pub struct OpenAiSpeechSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
    sample_rate: u32,
}

impl OpenAiSpeechSynthesizer {
    pub fn new(api_key: String, config: &SynthesisConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            sample_rate: config.sample_rate,
        }
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let url = format!("{}/audio/speech", self.base_url);
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Requesting speech");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(text))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Speech API error {status}: {body}");
        }

        let mut acc = PcmAccumulator::default();
        acc.push(&resp.bytes().await?);
        Ok(SynthesizedAudio {
            pcm: acc.finish(),
            sample_rate: self.sample_rate,
        })
    }
}

/// ElevenLabs streaming endpoint with `output_format=pcm_<rate>`.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
    sample_rate: u32,
}

/// Streaming TTS URL for `voice`, asking for raw PCM at `sample_rate`.
///
/// The output format is only honored as a query parameter.
pub fn build_elevenlabs_url(base_url: &str, voice: &str, sample_rate: u32) -> String {
    format!(
        "{}/text-to-speech/{}/stream?output_format=pcm_{sample_rate}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(voice)
    )
}

impl ElevenLabsSynthesizer {
    pub fn new(api_key: String, config: &SynthesisConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.elevenlabs.io/v1".into()),
            model: config.model.clone(),
            voice: config.voice.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let url = build_elevenlabs_url(&self.base_url, &self.voice, self.sample_rate);
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let mut acc = PcmAccumulator::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => acc.push(&bytes),
                Err(e) => anyhow::bail!("TTS stream error: {e}"),
            }
        }

        Ok(SynthesizedAudio {
            pcm: acc.finish(),
            sample_rate: self.sample_rate,
        })
    }
}
