//! Media pipeline: audio normalization, VAD, utterance segmentation,
//! outbound pacing, STT and TTS collaborators.

pub mod audio;
pub mod ingest;
pub mod outbound;
pub mod stt;
pub mod tts;
pub mod vad;
