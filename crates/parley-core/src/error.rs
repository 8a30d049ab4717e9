use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Audio decode error: {0}")]
    AudioDecode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether this fault tears the whole session down.
    ///
    /// Channel and transport faults escalate; pipeline-stage faults stay
    /// contained to the current turn or frame.
    pub fn escalates(&self) -> bool {
        matches!(self, Self::Signaling(_) | Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
