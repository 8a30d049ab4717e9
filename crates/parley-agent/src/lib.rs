//! Voice agent runtime.
//!
//! Joins a room as a synthetic participant, segments the remote speaker's
//! audio into utterances, and answers each one with synthesized speech:
//! transcribe, generate, synthesize, then pace the audio out at real time.
//! Observers follow along through a broadcast of [`AgentEvent`]s.

pub mod events;
pub mod pipeline;
pub mod session;
pub mod state;
pub mod transport;

pub use events::{AgentEvent, EventBus};
pub use pipeline::{Collaborators, ConversationPipeline, TurnOutcome};
pub use session::VoiceAgent;
pub use state::StateMachine;
pub use transport::{
    IceConnectionState, InboundTrack, MediaFrame, MediaTransport, PeerConnectionState, TrackKind,
    TransportEvent, TransportFactory, TransportSetup,
};
