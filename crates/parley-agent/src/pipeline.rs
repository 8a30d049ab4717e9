//! Conversation pipeline: transcribe, generate, synthesize, play.
//!
//! One worker drains the bounded utterance queue, so exactly one turn is in
//! flight. Every stage failure degrades the turn, never the session, and
//! every exit path after `Processing` heads back to `Connected`.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::AgentConfig;
use parley_core::error::AgentError;
use parley_core::types::{ConversationHistory, SessionState, Turn};
use parley_media::ingest::Utterance;
use parley_media::outbound::OutboundScheduler;
use parley_media::stt::{self, SpeechRecognizer};
use parley_media::tts::SpeechSynthesizer;
use parley_providers::{CompletionRequest, LlmProvider};

use crate::events::{AgentEvent, EventBus};
use crate::state::StateMachine;

/// The three model collaborators a turn calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub llm: Arc<dyn LlmProvider>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent was not in `Connected` when the utterance arrived.
    Skipped,
    /// Recognition failed or produced nothing.
    EmptyTranscript,
    /// Synthesis failed; nothing was played.
    Silent { transcript: String, reply: String },
    Spoke {
        transcript: String,
        reply: String,
        used_fallback: bool,
        frames: usize,
    },
    /// Shut down mid-turn.
    Cancelled,
}

pub struct ConversationPipeline {
    config: Arc<AgentConfig>,
    collaborators: Collaborators,
    state: Arc<StateMachine>,
    events: EventBus,
    history: Arc<Mutex<ConversationHistory>>,
    scheduler: OutboundScheduler,
    cancel: CancellationToken,
}

impl ConversationPipeline {
    pub fn new(
        config: Arc<AgentConfig>,
        collaborators: Collaborators,
        state: Arc<StateMachine>,
        events: EventBus,
        history: Arc<Mutex<ConversationHistory>>,
        scheduler: OutboundScheduler,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            collaborators,
            state,
            events,
            history,
            scheduler,
            cancel,
        }
    }

    /// Drain the utterance queue until it closes or the session is cancelled.
    pub async fn run_worker(self: Arc<Self>, mut utterances: mpsc::Receiver<Utterance>) {
        loop {
            let utterance = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = utterances.recv() => match next {
                    Some(u) => u,
                    None => break,
                },
            };
            let outcome = self.run_turn(utterance).await;
            debug!(?outcome, "Turn finished");
        }
        debug!("Pipeline worker stopped");
    }

    /// Run one full turn for a flushed utterance.
    pub async fn run_turn(&self, utterance: Utterance) -> TurnOutcome {
        if !self.state.transition(SessionState::Processing) {
            warn!(state = %self.state.current(), frames = utterance.frame_count, "Dropping utterance, agent not ready");
            return TurnOutcome::Skipped;
        }
        info!(
            frames = utterance.frame_count,
            samples = utterance.pcm.len(),
            duration_ms = utterance.duration_ms,
            "Processing utterance"
        );

        let outcome = self.converse(utterance).await;
        self.state.transition(SessionState::Connected);
        outcome
    }

    async fn converse(&self, utterance: Utterance) -> TurnOutcome {
        let Some(transcript) = self.transcribe(&utterance).await else {
            return TurnOutcome::Cancelled;
        };
        if transcript.is_empty() {
            debug!("Empty transcript, nothing to answer");
            return TurnOutcome::EmptyTranscript;
        }
        info!(transcript = %transcript, "User said");
        self.events.emit(AgentEvent::Transcript {
            text: transcript.clone(),
        });

        let Some((reply, used_fallback)) = self.generate(&transcript).await else {
            return TurnOutcome::Cancelled;
        };

        if !self.state.transition(SessionState::Speaking) {
            return TurnOutcome::Cancelled;
        }

        let synthesis = tokio::select! {
            _ = self.cancel.cancelled() => return TurnOutcome::Cancelled,
            res = self.collaborators.synthesizer.synthesize(&reply) => res,
        };
        let audio = match synthesis {
            Ok(audio) => audio,
            Err(e) => {
                let err = AgentError::Synthesis(e.to_string());
                warn!(error = %err, "Synthesis failed, ending turn silently");
                return TurnOutcome::Silent { transcript, reply };
            }
        };

        debug!(samples = audio.pcm.len(), sample_rate = audio.sample_rate, "Playing reply");
        let frames = self
            .scheduler
            .play(&audio.pcm, audio.sample_rate, &self.cancel)
            .await;

        TurnOutcome::Spoke {
            transcript,
            reply,
            used_fallback,
            frames,
        }
    }

    /// Joined, trimmed transcript. Failures yield an empty string; `None`
    /// means cancelled.
    async fn transcribe(&self, utterance: &Utterance) -> Option<String> {
        let samples = utterance.samples();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            res = self.collaborators.recognizer.transcribe(&samples, utterance.sample_rate) => res,
        };
        match result {
            Ok(segments) => Some(stt::join_segments(&segments)),
            Err(e) => {
                let err = AgentError::Recognition(e.to_string());
                warn!(error = %err, "Transcription failed");
                Some(String::new())
            }
        }
    }

    /// Reply text and whether it is the fallback. `None` means cancelled.
    async fn generate(&self, transcript: &str) -> Option<(String, bool)> {
        let gen_config = &self.config.generation;
        let request = {
            let mut history = self.history.lock().await;
            history.push(Turn::user(transcript));
            CompletionRequest::from_history(gen_config, &history)
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            res = self.collaborators.llm.complete(&request) => res,
        };
        match result {
            Ok(completion) => {
                info!(reply = %completion.text, finish_reason = ?completion.finish_reason, "Agent replies");
                self.history
                    .lock()
                    .await
                    .push(Turn::assistant(completion.text.clone()));
                self.events.emit(AgentEvent::Reply {
                    text: completion.text.clone(),
                });
                Some((completion.text, false))
            }
            Err(e) => {
                let err = AgentError::Generation(e.to_string());
                warn!(error = %err, "Generation failed, using fallback reply");
                Some((gen_config.fallback_reply.clone(), true))
            }
        }
    }
}
