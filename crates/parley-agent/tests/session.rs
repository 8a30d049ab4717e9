//! Agent session tests: a real agent against a local signaling server,
//! with in-memory fakes for the media engine and the model collaborators.
//!
//! Run with: `cargo test -p parley-agent --test session`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use parley_agent::{
    AgentEvent, Collaborators, IceConnectionState, InboundTrack, MediaFrame, MediaTransport,
    TrackKind, TransportEvent, TransportFactory, TransportSetup, VoiceAgent,
};
use parley_core::config::AgentConfig;
use parley_core::error::AgentError;
use parley_core::protocol::{IceCandidate, SessionDescription};
use parley_core::types::{Role, SessionState};
use parley_media::audio::AudioFrame;
use parley_media::outbound::OutboundTrack;
use parley_media::stt::{SpeechRecognizer, TranscriptSegment};
use parley_media::tts::{SpeechSynthesizer, SynthesizedAudio};
use parley_providers::{Completion, CompletionRequest, LlmProvider};

const WAIT: Duration = Duration::from_secs(5);

// --- Fakes ---

#[derive(Default)]
struct FakeTransport {
    remote: StdMutex<Vec<SessionDescription>>,
    local: StdMutex<Option<SessionDescription>>,
    candidates: StdMutex<Vec<IceCandidate>>,
    closes: AtomicUsize,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        if description.sdp == "garbage" {
            anyhow::bail!("unparseable sdp");
        }
        self.remote.lock().unwrap().push(description);
        Ok(())
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        *self.local.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        if candidate.candidate == "late" {
            anyhow::bail!("no remote description for candidate");
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared [`FakeTransport`] and parks the event sender and
/// outbound track for the test to drive.
#[derive(Default)]
struct FakeFactory {
    transport: Arc<FakeTransport>,
    slot: StdMutex<Option<(mpsc::Sender<TransportEvent>, OutboundTrack)>>,
    fail: bool,
}

impl FakeFactory {
    fn take(&self) -> (mpsc::Sender<TransportEvent>, OutboundTrack) {
        self.slot.lock().unwrap().take().expect("transport not created")
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        setup: TransportSetup,
    ) -> anyhow::Result<(Arc<dyn MediaTransport>, mpsc::Receiver<TransportEvent>)> {
        if self.fail {
            anyhow::bail!("no media engine");
        }
        assert!(!setup.ice_servers.is_empty());
        let (tx, rx) = mpsc::channel(16);
        *self.slot.lock().unwrap() = Some((tx, setup.outbound));
        let transport: Arc<dyn MediaTransport> = self.transport.clone();
        Ok((transport, rx))
    }
}

struct FakeRecognizer;

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<TranscriptSegment>> {
        assert_eq!(sample_rate, 16_000);
        assert!(!samples.is_empty());
        Ok(vec![
            TranscriptSegment {
                text: " hello".into(),
                start: 0.0,
                end: 0.4,
                confidence: 0.9,
            },
            TranscriptSegment {
                text: " there ".into(),
                start: 0.4,
                end: 0.8,
                confidence: 0.9,
            },
        ])
    }
}

#[derive(Default)]
struct FakeLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for FakeLlm {
    fn id(&self) -> &str {
        "fake"
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.messages[0].role, Role::System);
        Ok(Completion {
            text: "Hi! How can I help?".into(),
            finish_reason: Some("stop".into()),
            usage: None,
        })
    }
}

#[derive(Default)]
struct FakeSynth {
    texts: StdMutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize(&self, text: &str) -> anyhow::Result<SynthesizedAudio> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(SynthesizedAudio {
            pcm: vec![3_000; 480 * 3],
            sample_rate: 24_000,
        })
    }
}

// --- Local signaling server ---

struct Room {
    url: String,
    to_agent: mpsc::UnboundedSender<Message>,
    from_agent: mpsc::UnboundedReceiver<String>,
}

impl Room {
    fn send(&self, raw: &str) {
        self.to_agent.send(Message::Text(raw.to_string().into())).unwrap();
    }

    async fn recv_json(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(WAIT, self.from_agent.recv())
            .await
            .expect("timed out waiting for agent message")
            .expect("agent hung up");
        serde_json::from_str(&text).unwrap()
    }

    /// Resolves once the agent side of the socket is gone.
    async fn agent_gone(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.from_agent.recv().await.is_some() {}
        })
        .await
        .expect("agent never closed the channel");
    }
}

/// Accept one agent and relay frames between it and the test.
async fn start_room() -> Room {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (to_agent, mut outbox) = mpsc::unbounded_channel::<Message>();
    let (inbox, from_agent) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                out = outbox.recv() => match out {
                    Some(msg) => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbox.send(text.as_str().to_string());
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    });

    Room {
        url,
        to_agent,
        from_agent,
    }
}

// --- Helpers ---

fn config_for(room: &Room) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.room.sfu_url = room.url.clone();
    config.room.room_name = "demo".into();
    config.room.participant_id = "agent-test".into();
    config.vad.silence_ms = 100;
    config
}

fn agent_with(config: AgentConfig, factory: Arc<FakeFactory>) -> (VoiceAgent, Arc<FakeLlm>, Arc<FakeSynth>) {
    let llm = Arc::new(FakeLlm::default());
    let synth = Arc::new(FakeSynth::default());
    let agent = VoiceAgent::new(
        config,
        Collaborators {
            recognizer: Arc::new(FakeRecognizer),
            llm: llm.clone(),
            synthesizer: synth.clone(),
        },
        factory,
    );
    (agent, llm, synth)
}

async fn wait_for_state(events: &mut broadcast::Receiver<AgentEvent>, wanted: SessionState) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let AgentEvent::StateChanged { state, .. } = events.recv().await.unwrap() {
                if state == wanted {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {wanted}"));
}

fn speech_frame() -> AudioFrame {
    // Post-gain RMS 0.2 with the default gain of 3.
    AudioFrame::from_f32(&vec![0.2 / 3.0; 960], 48_000, 1)
}

fn silence_frame() -> AudioFrame {
    AudioFrame::from_f32(&vec![0.0; 960], 48_000, 1)
}

/// Pull outbound audio on a 20ms clock the way a media engine would,
/// noting the agent state as each voiced frame leaves.
fn spawn_transport(
    mut outbound: OutboundTrack,
    agent: VoiceAgent,
    voiced_states: Arc<StdMutex<Vec<SessionState>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            if !outbound.next_frame().is_silence() {
                voiced_states.lock().unwrap().push(agent.state());
            }
        }
    })
}

fn track(kind: TrackKind, capacity: usize) -> (mpsc::Sender<MediaFrame>, InboundTrack) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        tx,
        InboundTrack {
            id: format!("{kind:?}-0").to_lowercase(),
            kind,
            frames: rx,
        },
    )
}

// --- Tests ---

#[tokio::test]
async fn test_connect_and_answer_offer() {
    let mut room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory.clone());
    let mut events = agent.subscribe();

    agent.connect().await.unwrap();
    assert_eq!(agent.state(), SessionState::Connected);
    assert_eq!(
        events.recv().await.unwrap(),
        AgentEvent::StateChanged {
            previous: SessionState::Disconnected,
            state: SessionState::Connecting
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        AgentEvent::StateChanged {
            previous: SessionState::Connecting,
            state: SessionState::Connected
        }
    );

    room.send(r#"{"type":"offer","data":{"sdp":"v=0 remote-offer","type":"offer"}}"#);
    let answer = room.recv_json().await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["data"]["type"], "answer");
    assert_eq!(answer["data"]["sdp"], "v=0 fake-answer");
    assert_eq!(factory.transport.remote.lock().unwrap()[0].sdp, "v=0 remote-offer");

    // Remote candidates, including one the transport rejects.
    room.send(r#"{"type":"candidate","data":{"candidate":"late"}}"#);
    room.send(r#"{"type":"candidate","data":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}"#);
    room.send(r#"{"type":"client-left","data":{"clientId":"someone"}}"#);

    // Local candidates are trickled out.
    let (transport_events, _outbound) = factory.take();
    transport_events
        .send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:9 1 udp 1 10.0.0.9 9999 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }))
        .await
        .unwrap();
    let candidate = room.recv_json().await;
    assert_eq!(candidate["type"], "candidate");
    assert_eq!(candidate["data"]["sdpMid"], "0");

    assert_eq!(factory.transport.candidates.lock().unwrap().len(), 1);
    assert_eq!(agent.state(), SessionState::Connected);

    agent.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_full_turn_over_audio_track() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, llm, synth) = agent_with(config_for(&room), factory.clone());
    let mut events = agent.subscribe();

    agent.connect().await.unwrap();
    let (transport_events, outbound) = factory.take();
    let voiced_states = Arc::new(StdMutex::new(Vec::new()));
    let transport = spawn_transport(outbound, agent.clone(), voiced_states.clone());
    let (frames, audio_track) = track(TrackKind::Audio, 64);
    transport_events
        .send(TransportEvent::Track(audio_track))
        .await
        .unwrap();

    for _ in 0..5 {
        frames.send(MediaFrame::Audio(speech_frame())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for _ in 0..10 {
        frames.send(MediaFrame::Audio(silence_frame())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    wait_for_state(&mut events, SessionState::Speaking).await;
    wait_for_state(&mut events, SessionState::Connected).await;

    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*synth.texts.lock().unwrap(), vec!["Hi! How can I help?".to_string()]);

    let history = agent.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, "hello there");
    assert_eq!(history[1].role, Role::Assistant);

    // 1440 samples at 24 kHz land as three 20ms frames at 48 kHz, all taken
    // by the transport before the agent went back to listening.
    assert_eq!(
        *voiced_states.lock().unwrap(),
        vec![SessionState::Speaking; 3]
    );

    transport.abort();
    agent.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_rejected_on_connect() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let mut config = config_for(&room);
    config.audio.frame_ms = 0;
    let (agent, _, _) = agent_with(config, factory.clone());

    let err = agent.connect().await.unwrap_err();
    assert!(matches!(err, AgentError::Config(ref msg) if msg.contains("frame_ms")), "{err}");
    assert_eq!(agent.state(), SessionState::Disconnected);
    assert!(factory.slot.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_transcript_and_reply_events() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory.clone());
    let mut events = agent.subscribe();

    agent.connect().await.unwrap();
    let (transport_events, _outbound) = factory.take();
    let (frames, audio_track) = track(TrackKind::Audio, 64);
    transport_events
        .send(TransportEvent::Track(audio_track))
        .await
        .unwrap();
    frames.send(MediaFrame::Audio(speech_frame())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    frames.send(MediaFrame::Audio(silence_frame())).await.unwrap();

    let mut transcript = None;
    let mut reply = None;
    tokio::time::timeout(WAIT, async {
        while reply.is_none() {
            match events.recv().await.unwrap() {
                AgentEvent::Transcript { text } => transcript = Some(text),
                AgentEvent::Reply { text } => reply = Some(text),
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(transcript.as_deref(), Some("hello there"));
    assert_eq!(reply.as_deref(), Some("Hi! How can I help?"));

    agent.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_video_track_is_drained() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, llm, _) = agent_with(config_for(&room), factory.clone());
    let mut events = agent.subscribe();

    agent.connect().await.unwrap();
    let (transport_events, _outbound) = factory.take();
    let (frames, video_track) = track(TrackKind::Video, 2);
    transport_events
        .send(TransportEvent::Track(video_track))
        .await
        .unwrap();

    // Far more frames than the channel holds: only a draining consumer lets
    // this finish.
    tokio::time::timeout(WAIT, async {
        for i in 0..200u32 {
            frames.send(MediaFrame::Video(vec![i as u8; 64])).await.unwrap();
        }
    })
    .await
    .expect("video frames backed up");

    assert_eq!(agent.state(), SessionState::Connected);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    // Only the connect transitions happened.
    let mut changes = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, AgentEvent::StateChanged { .. }) {
            changes += 1;
        }
    }
    assert_eq!(changes, 2);

    agent.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_ice_failure_disconnects() {
    let mut room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory.clone());

    agent.connect().await.unwrap();
    let (transport_events, _outbound) = factory.take();
    transport_events
        .send(TransportEvent::IceConnectionState(IceConnectionState::Checking))
        .await
        .unwrap();
    transport_events
        .send(TransportEvent::IceConnectionState(IceConnectionState::Failed))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, agent.wait_disconnected())
        .await
        .unwrap();
    assert_eq!(agent.state(), SessionState::Disconnected);
    assert_eq!(factory.transport.closes.load(Ordering::SeqCst), 1);
    room.agent_gone().await;
}

#[tokio::test]
async fn test_disconnect_twice() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory.clone());
    let mut events = agent.subscribe();

    agent.connect().await.unwrap();
    agent.disconnect().await.unwrap();
    assert_eq!(agent.state(), SessionState::Disconnected);
    agent.disconnect().await.unwrap();
    assert_eq!(agent.state(), SessionState::Disconnected);

    assert_eq!(factory.transport.closes.load(Ordering::SeqCst), 1);
    let disconnects = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| {
            matches!(
                e,
                AgentEvent::StateChanged {
                    state: SessionState::Disconnected,
                    ..
                }
            )
        })
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_disconnect_before_connect_is_noop() {
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(AgentConfig::default(), factory);
    agent.disconnect().await.unwrap();
    assert_eq!(agent.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_signaling_close_disconnects() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory.clone());

    agent.connect().await.unwrap();
    room.to_agent.send(Message::Close(None)).unwrap();

    tokio::time::timeout(WAIT, agent.wait_disconnected())
        .await
        .unwrap();
    assert_eq!(factory.transport.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_message_disconnects() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory.clone());

    agent.connect().await.unwrap();
    room.send(r#"{"type":"mute","data":{}}"#);

    tokio::time::timeout(WAIT, agent.wait_disconnected())
        .await
        .unwrap();
    assert_eq!(agent.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_bad_offer_disconnects() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory.clone());

    agent.connect().await.unwrap();
    room.send(r#"{"type":"offer","data":{"sdp":"garbage","type":"offer"}}"#);

    tokio::time::timeout(WAIT, agent.wait_disconnected())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_connect_failures_leave_agent_disconnected() {
    // Nothing listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = AgentConfig::default();
    config.room.sfu_url = format!("ws://127.0.0.1:{port}/ws");
    let (agent, _, _) = agent_with(config, Arc::new(FakeFactory::default()));
    let err = agent.connect().await.unwrap_err();
    assert!(matches!(err, AgentError::Signaling(_)));
    assert_eq!(agent.state(), SessionState::Disconnected);

    // Media engine refuses to create a session.
    let room = start_room().await;
    let factory = Arc::new(FakeFactory {
        fail: true,
        ..Default::default()
    });
    let (agent, _, _) = agent_with(config_for(&room), factory);
    let err = agent.connect().await.unwrap_err();
    assert!(matches!(err, AgentError::Transport(_)));
    assert_eq!(agent.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_connect_twice_rejected() {
    let room = start_room().await;
    let factory = Arc::new(FakeFactory::default());
    let (agent, _, _) = agent_with(config_for(&room), factory);

    agent.connect().await.unwrap();
    assert!(agent.connect().await.is_err());
    assert_eq!(agent.state(), SessionState::Connected);
    agent.disconnect().await.unwrap();
}
