//! Configuration loading and validation.
//!
//! The agent configuration is read once at startup from a JSON5 file and is
//! immutable afterwards. Every section has defaults, so a missing file or a
//! partial file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::types::ConversationHistory;

/// Top-level Parley agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub room: RoomConfig,
    pub recognition: RecognitionConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Which room to join and as whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Signaling endpoint of the SFU (e.g. "ws://localhost:8080/ws").
    pub sfu_url: String,

    pub room_name: String,

    /// Participant identity; generated once at load when absent.
    pub participant_id: String,

    /// STUN/TURN URLs handed to the media transport.
    pub ice_servers: Vec<String>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            sfu_url: "ws://localhost:8080/ws".into(),
            room_name: "test".into(),
            participant_id: default_participant_id(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
        }
    }
}

fn default_participant_id() -> String {
    format!("agent-{}", uuid::Uuid::new_v4())
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Provider: "openai" or "groq" (default: "openai").
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Versioned API root the endpoint path is appended to
    /// (default: provider's, e.g. "https://api.openai.com/v1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Model name (e.g. "whisper-1", "whisper-large-v3-turbo").
    pub model: String,

    /// ISO 639-1 language hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Rate the recognizer expects its input at.
    pub sample_rate: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            base_url: None,
            model: "whisper-1".into(),
            language: None,
            sample_rate: 16_000,
        }
    }
}

impl RecognitionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Reply generation (LLM) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Provider: "openai", "openrouter" or "ollama" (default: "openai").
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Versioned API root the endpoint path is appended to
    /// (default: provider's, e.g. "https://api.openai.com/v1", "http://localhost:11434/v1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    pub model: String,

    /// System instructions sent ahead of the history.
    pub instructions: String,

    pub max_tokens: u32,

    pub temperature: f64,

    /// Spoken instead of a reply when generation fails.
    pub fallback_reply: String,

    /// Maximum retained history turns.
    pub history_limit: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            base_url: None,
            model: "gpt-4".into(),
            instructions: "You are a helpful AI assistant in a voice conversation. \
                           Keep your responses concise and natural."
                .into(),
            max_tokens: 150,
            temperature: 0.7,
            fallback_reply: "I apologize, but I encountered an error processing your request."
                .into(),
            history_limit: 10,
        }
    }
}

impl GenerationConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Provider: "openai" or "elevenlabs" (default: "openai").
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Versioned API root the endpoint path is appended to
    /// (default: "https://api.openai.com/v1" or "https://api.elevenlabs.io/v1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Model ID (e.g. "tts-1", "eleven_turbo_v2").
    pub model: String,

    /// Voice ID (e.g. "alloy", or an ElevenLabs voice id).
    pub voice: String,

    /// Rate of the raw PCM the provider returns.
    pub sample_rate: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            base_url: None,
            model: "tts-1".into(),
            voice: "alloy".into(),
            sample_rate: 24_000,
        }
    }
}

impl SynthesisConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Audio format of the media session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Outbound track sample rate.
    pub sample_rate: u32,

    pub channels: u16,

    /// Frame duration in milliseconds (10, 20, 40 or 60).
    pub frame_ms: u32,

    /// Gain applied to inbound audio before VAD, range (0, 20].
    pub input_gain: f32,

    /// Cap on the rolling inbound frame log between flushes.
    pub log_capacity_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            frame_ms: 20,
            input_gain: 3.0,
            log_capacity_frames: 3_000,
        }
    }
}

impl AudioConfig {
    /// Samples in one outbound frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Energy-based voice activity detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS threshold on normalized samples, range (0, 1).
    pub threshold: f32,

    /// Silence after the last speech frame that ends an utterance.
    pub silence_ms: u64,

    /// Suspend VAD while the agent is speaking (echo avoidance).
    pub mute_while_speaking: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            silence_ms: 1_500,
            mute_while_speaking: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Depth of the utterance queue; utterances beyond it are dropped.
    pub utterance_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { utterance_queue: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_media=debug").
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "plain".into(),
            level: None,
            filters: Vec::new(),
            output: "stderr".into(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| AgentError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl AgentConfig {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::parse(&raw)?;
        tracing::debug!(path = %path.display(), room = %config.room.room_name, "Loaded config");
        Ok(config)
    }

    /// Parse config text (JSON5).
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Default config file location: `~/.parley/config.json5`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json5")
    }

    /// Signaling channel URL, parameterized by room and participant.
    pub fn signaling_url(&self) -> String {
        let base = self.room.sfu_url.trim_end_matches(['?', '&']);
        let sep = if base.contains('?') { '&' } else { '?' };
        format!(
            "{base}{sep}room={}&userId={}",
            urlencoding::encode(&self.room.room_name),
            urlencoding::encode(&self.room.participant_id)
        )
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let url = &self.room.sfu_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            errors.push(format!("room.sfu_url must use ws:// or wss://: {url}"));
        }
        if self.room.room_name.is_empty() {
            errors.push("room.room_name cannot be empty".to_string());
        }
        if self.room.participant_id.is_empty() {
            errors.push("room.participant_id cannot be empty".to_string());
        }

        if self.recognition.resolve_api_key().is_none() {
            warnings.push(format!(
                "Recognition provider '{}' has no API key configured",
                self.recognition.provider
            ));
        }
        if self.generation.provider != "ollama" && self.generation.resolve_api_key().is_none() {
            warnings.push(format!(
                "Generation provider '{}' has no API key configured",
                self.generation.provider
            ));
        }
        if self.synthesis.resolve_api_key().is_none() {
            warnings.push(format!(
                "Synthesis provider '{}' has no API key configured",
                self.synthesis.provider
            ));
        }

        for (name, rate) in [
            ("audio.sample_rate", self.audio.sample_rate),
            ("recognition.sample_rate", self.recognition.sample_rate),
            ("synthesis.sample_rate", self.synthesis.sample_rate),
        ] {
            if !(8_000..=96_000).contains(&rate) {
                errors.push(format!("{name} must be within 8000..=96000 Hz, got {rate}"));
            }
        }
        if !matches!(self.audio.channels, 1 | 2) {
            errors.push(format!("audio.channels must be 1 or 2, got {}", self.audio.channels));
        }
        if !matches!(self.audio.frame_ms, 10 | 20 | 40 | 60) {
            errors.push(format!(
                "audio.frame_ms must be one of 10, 20, 40, 60, got {}",
                self.audio.frame_ms
            ));
        }
        if !(self.audio.input_gain > 0.0 && self.audio.input_gain <= 20.0) {
            errors.push(format!(
                "audio.input_gain must be within (0, 20], got {}",
                self.audio.input_gain
            ));
        }
        if !(self.vad.threshold > 0.0 && self.vad.threshold < 1.0) {
            errors.push(format!(
                "vad.threshold must be within (0, 1), got {}",
                self.vad.threshold
            ));
        }
        if !(100..=10_000).contains(&self.vad.silence_ms) {
            errors.push(format!(
                "vad.silence_ms must be within 100..=10000, got {}",
                self.vad.silence_ms
            ));
        }
        if !(2..=ConversationHistory::MAX_LIMIT).contains(&self.generation.history_limit) {
            errors.push(format!(
                "generation.history_limit must be within 2..={}, got {}",
                ConversationHistory::MAX_LIMIT,
                self.generation.history_limit
            ));
        }
        if self.generation.max_tokens == 0 {
            errors.push("generation.max_tokens must be at least 1".to_string());
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            errors.push(format!(
                "generation.temperature must be within 0..=2, got {}",
                self.generation.temperature
            ));
        }
        if self.pipeline.utterance_queue == 0 {
            errors.push("pipeline.utterance_queue must be at least 1".to_string());
        }
        if !self.vad.mute_while_speaking {
            warnings.push(
                "vad.mute_while_speaking is off; the agent may react to its own voice".to_string(),
            );
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
