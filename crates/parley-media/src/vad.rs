//! RMS-energy voice activity detection with a silence hangover.

use std::time::{Duration, Instant};

/// Edge reported by [`VoiceActivityDetector::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// First speech frame after silence.
    SpeechStarted,
    /// Silence has lasted long enough after the last speech frame.
    SpeechEnded,
}

/// Voice Activity Detector using an RMS threshold on normalized samples
/// and a wall-clock silence timeout.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    /// RMS threshold for speech detection.
    threshold: f32,
    /// Silence after the last speech frame before declaring speech end.
    silence: Duration,
    /// Current state: true = speech active.
    speech_active: bool,
    last_speech: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f32, silence: Duration) -> Self {
        Self {
            threshold,
            silence,
            speech_active: false,
            last_speech: None,
        }
    }

    /// Whether a frame with this energy counts as speech.
    pub fn is_speech(&self, energy: f32) -> bool {
        energy > self.threshold
    }

    /// Process the energy of one frame observed at `now`.
    ///
    /// Returns:
    /// - `Some(SpeechStarted)` on the first speech frame of a run
    /// - `Some(SpeechEnded)` once `now - last_speech >= silence`
    /// - `None` otherwise
    pub fn process(&mut self, energy: f32, now: Instant) -> Option<VadEvent> {
        if self.is_speech(energy) {
            self.last_speech = Some(now);
            if !self.speech_active {
                self.speech_active = true;
                return Some(VadEvent::SpeechStarted);
            }
        } else if self.speech_active {
            let quiet_for = self
                .last_speech
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            if quiet_for >= self.silence {
                self.speech_active = false;
                return Some(VadEvent::SpeechEnded);
            }
        }

        None
    }

    /// Whether speech is currently active.
    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    pub fn last_speech(&self) -> Option<Instant> {
        self.last_speech
    }

    /// Reset the detector state.
    pub fn reset(&mut self) {
        self.speech_active = false;
        self.last_speech = None;
    }
}
