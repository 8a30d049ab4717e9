//! Voice agent session orchestration.
//!
//! [`VoiceAgent::connect`] opens the signaling channel, creates the media
//! session, and spawns the session tasks:
//!
//! - signaling receive loop (offer/answer/candidate dispatch)
//! - transport event loop (tracks, connection state, local candidates)
//! - one ingest task per inbound audio track, one drain task per video track
//! - the conversation pipeline worker
//!
//! All tasks run inside the agent's span and stop on the session's
//! cancellation token. [`VoiceAgent::disconnect`] is idempotent.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use parley_core::config::AgentConfig;
use parley_core::error::{AgentError, Result};
use parley_core::protocol::{SessionDescription, SignalingMessage};
use parley_core::types::{ConversationHistory, SessionState, Turn};
use parley_media::ingest::{IngestOutcome, IngestPipeline, IngestSettings, Utterance};
use parley_media::outbound::outbound_channel;
use parley_signaling::{SignalSender, SignalingClient, SignalingStream};

use crate::events::{AgentEvent, EventBus};
use crate::pipeline::{Collaborators, ConversationPipeline};
use crate::state::StateMachine;
use crate::transport::{
    InboundTrack, MediaFrame, MediaTransport, TrackKind, TransportEvent, TransportFactory,
    TransportSetup,
};

/// A synthetic room participant.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct VoiceAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: Arc<AgentConfig>,
    collaborators: Collaborators,
    transport_factory: Arc<dyn TransportFactory>,
    events: EventBus,
    state: Arc<StateMachine>,
    history: Arc<Mutex<ConversationHistory>>,
    live: Mutex<Option<LiveSession>>,
    span: tracing::Span,
}

/// Resources owned by one connected session.
struct LiveSession {
    signaling: Arc<dyn SignalSender>,
    transport: Arc<dyn MediaTransport>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceAgent {
    pub fn new(
        config: AgentConfig,
        collaborators: Collaborators,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let span = info_span!(
            "agent",
            room = %config.room.room_name,
            participant = %config.room.participant_id
        );
        let events = EventBus::new();
        let history = ConversationHistory::new(config.generation.history_limit);
        Self {
            inner: Arc::new(AgentInner {
                config: Arc::new(config),
                collaborators,
                transport_factory,
                state: Arc::new(StateMachine::new(events.clone())),
                events,
                history: Arc::new(Mutex::new(history)),
                live: Mutex::new(None),
                span,
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the conversation history, oldest first.
    pub async fn history(&self) -> Vec<Turn> {
        self.inner.history.lock().await.turns().cloned().collect()
    }

    /// Join the configured room.
    ///
    /// Only valid from `Disconnected`. On failure the agent is back in
    /// `Disconnected` and anything opened so far is closed.
    pub async fn connect(&self) -> Result<()> {
        let span = self.inner.span.clone();
        self.connect_inner().instrument(span).await
    }

    async fn connect_inner(&self) -> Result<()> {
        let inner = &self.inner;
        let (warnings, errors) = inner.config.validate();
        for w in &warnings {
            warn!("Config: {w}");
        }
        if !errors.is_empty() {
            return Err(AgentError::Config(errors.join("; ")));
        }

        if !inner.state.transition(SessionState::Connecting) {
            return Err(AgentError::Other(anyhow::anyhow!(
                "connect requires a disconnected agent (state: {})",
                inner.state.current()
            )));
        }

        let url = inner.config.signaling_url();
        let (client, stream) = match SignalingClient::connect(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Signaling connect failed");
                inner.state.transition(SessionState::Disconnected);
                return Err(e);
            }
        };
        let signaling: Arc<dyn SignalSender> = Arc::new(client);

        let audio = &inner.config.audio;
        let (scheduler, outbound) = outbound_channel(audio.sample_rate, audio.frame_ms);
        let setup = TransportSetup {
            ice_servers: inner.config.room.ice_servers.clone(),
            outbound,
        };
        let (transport, transport_events) = match inner.transport_factory.create(setup).await {
            Ok(pair) => pair,
            Err(e) => {
                let err = AgentError::Transport(e.to_string());
                error!(error = %err, "Media session setup failed");
                signaling.close().await;
                inner.state.transition(SessionState::Disconnected);
                return Err(err);
            }
        };

        // Held until the session is recorded, so a task that fails
        // immediately sees it when it disconnects.
        let mut live = inner.live.lock().await;
        if inner.state.current() != SessionState::Connecting {
            drop(live);
            signaling.close().await;
            if let Err(e) = transport.close().await {
                warn!(error = %e, "Media session close failed");
            }
            return Err(AgentError::Other(anyhow::anyhow!(
                "disconnected while connecting"
            )));
        }

        let cancel = CancellationToken::new();
        let (utterance_tx, utterance_rx) = mpsc::channel(inner.config.pipeline.utterance_queue.max(1));
        let pipeline = Arc::new(ConversationPipeline::new(
            inner.config.clone(),
            inner.collaborators.clone(),
            inner.state.clone(),
            inner.events.clone(),
            inner.history.clone(),
            scheduler,
            cancel.clone(),
        ));

        let tasks = vec![
            tokio::spawn(pipeline.run_worker(utterance_rx).instrument(inner.span.clone())),
            tokio::spawn(
                self.clone()
                    .signaling_loop(stream, transport.clone(), signaling.clone(), cancel.clone())
                    .instrument(inner.span.clone()),
            ),
            tokio::spawn(
                self.clone()
                    .transport_loop(transport_events, signaling.clone(), utterance_tx, cancel.clone())
                    .instrument(inner.span.clone()),
            ),
        ];

        *live = Some(LiveSession {
            signaling,
            transport,
            cancel,
            tasks,
        });
        inner.state.transition(SessionState::Connected);
        drop(live);

        info!(url, "Joined room");
        Ok(())
    }

    /// Leave the room. Safe from any state and safe to repeat.
    pub async fn disconnect(&self) -> Result<()> {
        let span = self.inner.span.clone();
        async {
            let live = self.inner.live.lock().await.take();
            if let Some(live) = live {
                live.cancel.cancel();
                live.signaling.close().await;
                if let Err(e) = live.transport.close().await {
                    warn!(error = %e, "Media session close failed");
                }
                // Tasks exit on the token; the caller may be one of them.
                drop(live.tasks);
                info!("Left room");
            }
            self.inner.state.transition(SessionState::Disconnected);
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Resolve once the agent reaches `Disconnected`.
    pub async fn wait_disconnected(&self) {
        let mut events = self.subscribe();
        while self.state() != SessionState::Disconnected {
            match events.recv().await {
                Ok(AgentEvent::StateChanged {
                    state: SessionState::Disconnected,
                    ..
                })
                | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }
    }

    async fn signaling_loop(
        self,
        mut stream: SignalingStream,
        transport: Arc<dyn MediaTransport>,
        signaling: Arc<dyn SignalSender>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                None => {
                    info!("Signaling channel closed");
                    break;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Signaling receive failed");
                    break;
                }
                Some(Ok(message)) => {
                    if let Err(e) = handle_signal(message, transport.as_ref(), signaling.as_ref()).await {
                        error!(error = %e, "Signaling dispatch failed");
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.disconnect().await {
            warn!(error = %e, "Disconnect after signaling loss failed");
        }
    }

    async fn transport_loop(
        self,
        mut events: mpsc::Receiver<TransportEvent>,
        signaling: Arc<dyn SignalSender>,
        utterances: mpsc::Sender<Utterance>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!("Transport event stream ended");
                return;
            };

            if event.is_failure() {
                let err = AgentError::Transport(format!("{event:?}"));
                error!(error = %err, "Media session failed");
                if let Err(e) = self.disconnect().await {
                    warn!(error = %e, "Disconnect after transport failure failed");
                }
                return;
            }

            match event {
                TransportEvent::Track(track) => self.attach_track(track, utterances.clone(), cancel.clone()),
                TransportEvent::ConnectionState(state) => info!(?state, "Connection state"),
                TransportEvent::IceConnectionState(state) => info!(?state, "ICE connection state"),
                TransportEvent::LocalCandidate(candidate) => {
                    signaling.send(&SignalingMessage::Candidate(candidate)).await;
                }
            }
        }
    }

    fn attach_track(&self, track: InboundTrack, utterances: mpsc::Sender<Utterance>, cancel: CancellationToken) {
        info!(track = %track.id, kind = ?track.kind, "Track received");
        let span = self.inner.span.clone();
        match track.kind {
            TrackKind::Audio => {
                let settings = IngestSettings::from_config(&self.inner.config);
                let mute = self.inner.config.vad.mute_while_speaking;
                let state = self.inner.state.clone();
                tokio::spawn(ingest_track(track, settings, state, mute, utterances, cancel).instrument(span));
            }
            TrackKind::Video => {
                tokio::spawn(drain_track(track, cancel).instrument(span));
            }
        }
    }
}

/// Dispatch one inbound signaling message.
///
/// Candidate failures are tolerated; anything else that fails ends the session.
async fn handle_signal(
    message: SignalingMessage,
    transport: &dyn MediaTransport,
    signaling: &dyn SignalSender,
) -> Result<()> {
    debug!(kind = message.kind(), "Signaling message");
    match message {
        SignalingMessage::Offer(offer) => {
            transport
                .set_remote_description(offer)
                .await
                .map_err(|e| AgentError::Transport(format!("set remote offer: {e}")))?;
            let answer = transport
                .create_answer()
                .await
                .map_err(|e| AgentError::Transport(format!("create answer: {e}")))?;
            transport
                .set_local_description(answer.clone())
                .await
                .map_err(|e| AgentError::Transport(format!("set local answer: {e}")))?;
            let local: SessionDescription = transport.local_description().await.unwrap_or(answer);
            signaling.send(&SignalingMessage::Answer(local)).await;
            info!("Answered offer");
        }
        SignalingMessage::Answer(answer) => {
            transport
                .set_remote_description(answer)
                .await
                .map_err(|e| AgentError::Transport(format!("set remote answer: {e}")))?;
        }
        SignalingMessage::Candidate(candidate) => {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                debug!(error = %e, "Ignoring ICE candidate");
            }
        }
        SignalingMessage::PeerLeft(peer) => {
            info!(client = ?peer.client_id, "Peer left the room");
        }
    }
    Ok(())
}

/// Feed one audio track through its own ingest pipeline, strictly in order.
async fn ingest_track(
    mut track: InboundTrack,
    settings: IngestSettings,
    state: Arc<StateMachine>,
    mute_while_speaking: bool,
    utterances: mpsc::Sender<Utterance>,
    cancel: CancellationToken,
) {
    let mut ingest = IngestPipeline::new(settings);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = track.frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let MediaFrame::Audio(frame) = frame else {
            trace!(track = %track.id, "Ignoring non-audio frame on audio track");
            continue;
        };

        let listening = state.is_listening(mute_while_speaking);
        let now = tokio::time::Instant::now().into_std();
        match ingest.push_frame(&frame, now, listening) {
            Ok(IngestOutcome::Flushed(utterance)) => match utterances.try_send(utterance) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!(frames = dropped.frame_count, "Utterance queue full, dropping utterance");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
            Ok(IngestOutcome::SpeechStarted) => debug!(track = %track.id, "Speech started"),
            Ok(_) => {}
            Err(e) => debug!(track = %track.id, error = %e, "Skipping undecodable frame"),
        }
    }
    debug!(track = %track.id, frames = ingest.frames_seen(), "Audio track ended");
}

/// Consume and discard video frames so the transport never backs up.
async fn drain_track(mut track: InboundTrack, cancel: CancellationToken) {
    let mut drained: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = track.frames.recv() => match frame {
                Some(_) => drained += 1,
                None => break,
            },
        }
    }
    debug!(track = %track.id, drained, "Video track ended");
}
