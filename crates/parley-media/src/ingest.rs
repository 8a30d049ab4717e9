//! Per-track audio ingest: normalization, frame log, and VAD-driven
//! utterance segmentation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use parley_core::config::AgentConfig;
use parley_core::error::Result;

use crate::audio::{self, AudioFrame};
use crate::vad::{VadEvent, VoiceActivityDetector};

/// Frames between periodic energy diagnostics.
const DIAGNOSTIC_INTERVAL: u64 = 100;

/// Tunables for one ingest pipeline.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Rate frames are resampled to before buffering.
    pub target_rate: u32,
    pub gain: f32,
    pub threshold: f32,
    pub silence: Duration,
    /// Cap on the rolling frame log.
    pub log_capacity: usize,
}

impl IngestSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            target_rate: config.recognition.sample_rate,
            gain: config.audio.input_gain,
            threshold: config.vad.threshold,
            silence: Duration::from_millis(config.vad.silence_ms),
            log_capacity: config.audio.log_capacity_frames.max(1),
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// A flushed run of speech frames, ready for recognition.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Concatenated 16-bit PCM at `sample_rate`.
    pub pcm: Vec<i16>,
    pub frame_count: usize,
    pub sample_rate: u32,
    pub duration_ms: u64,
}

impl Utterance {
    fn from_frames(frames: Vec<Vec<i16>>, sample_rate: u32) -> Self {
        let frame_count = frames.len();
        let pcm: Vec<i16> = frames.concat();
        let duration_ms = if sample_rate == 0 {
            0
        } else {
            pcm.len() as u64 * 1000 / sample_rate as u64
        };
        Self {
            pcm,
            frame_count,
            sample_rate,
            duration_ms,
        }
    }

    /// Samples as [-1, 1] floats for the recognizer.
    pub fn samples(&self) -> Vec<f32> {
        audio::to_f32(&self.pcm)
    }
}

/// What a single pushed frame did to the pipeline.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Frame was logged; VAD was not evaluated.
    Logged,
    /// Below threshold with no speech in progress.
    Silence,
    /// First speech frame of a run.
    SpeechStarted,
    /// Speech frame appended to the utterance.
    Speech,
    /// Below threshold inside a speech run, before the silence timeout.
    Pause,
    /// Silence timeout reached; the utterance is handed over and buffers cleared.
    Flushed(Utterance),
}

/// Audio ingest pipeline for one inbound track.
///
/// Every decoded frame lands in the rolling frame log; only speech frames
/// land in the utterance buffer. Both are cleared on flush.
pub struct IngestPipeline {
    settings: IngestSettings,
    vad: VoiceActivityDetector,
    frame_log: VecDeque<Vec<i16>>,
    utterance: Vec<Vec<i16>>,
    frames_seen: u64,
}

impl IngestPipeline {
    pub fn new(settings: IngestSettings) -> Self {
        let vad = VoiceActivityDetector::new(settings.threshold, settings.silence);
        Self {
            settings,
            vad,
            frame_log: VecDeque::new(),
            utterance: Vec::new(),
            frames_seen: 0,
        }
    }

    /// Push one inbound frame observed at `now`.
    ///
    /// With `listening == false` the frame only extends the frame log.
    /// Undecodable frames return an error and leave all buffers untouched.
    pub fn push_frame(
        &mut self,
        frame: &AudioFrame,
        now: Instant,
        listening: bool,
    ) -> Result<IngestOutcome> {
        let interleaved = audio::decode(frame)?;
        let mut mono = audio::downmix(&interleaved, frame.channels);
        audio::apply_gain(&mut mono, self.settings.gain);
        let energy = audio::rms(&mono);

        let resampled = audio::resample_linear(&mono, frame.sample_rate, self.settings.target_rate);
        let pcm = audio::quantize(&resampled);

        self.frames_seen += 1;
        if self.frames_seen % DIAGNOSTIC_INTERVAL == 0 {
            debug!(frames = self.frames_seen, energy, "Inbound audio");
        }

        self.frame_log.push_back(pcm.clone());
        while self.frame_log.len() > self.settings.log_capacity {
            self.frame_log.pop_front();
        }

        if !listening {
            return Ok(IngestOutcome::Logged);
        }

        let outcome = match self.vad.process(energy, now) {
            Some(VadEvent::SpeechStarted) => {
                trace!(energy, "Speech started");
                self.utterance.clear();
                self.utterance.push(pcm);
                IngestOutcome::SpeechStarted
            }
            Some(VadEvent::SpeechEnded) => {
                let frames = std::mem::take(&mut self.utterance);
                self.frame_log.clear();
                let utterance = Utterance::from_frames(frames, self.settings.target_rate);
                debug!(
                    frames = utterance.frame_count,
                    samples = utterance.pcm.len(),
                    duration_ms = utterance.duration_ms,
                    "Speech ended, flushing utterance"
                );
                IngestOutcome::Flushed(utterance)
            }
            None if self.vad.is_active() && self.vad.is_speech(energy) => {
                self.utterance.push(pcm);
                IngestOutcome::Speech
            }
            None if self.vad.is_active() => IngestOutcome::Pause,
            None => IngestOutcome::Silence,
        };

        Ok(outcome)
    }

    /// Frames logged since the last flush or reset.
    pub fn frame_log_len(&self) -> usize {
        self.frame_log.len()
    }

    /// Frames in the in-progress utterance.
    pub fn utterance_len(&self) -> usize {
        self.utterance.len()
    }

    pub fn in_speech(&self) -> bool {
        self.vad.is_active()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn reset(&mut self) {
        self.vad.reset();
        self.frame_log.clear();
        self.utterance.clear();
    }
}
