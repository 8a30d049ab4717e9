//! Media transport seam.
//!
//! The negotiated media session (ICE, DTLS, SRTP, codecs) lives behind
//! [`MediaTransport`]. The agent drives negotiation through it and consumes
//! its [`TransportEvent`] stream.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use parley_core::protocol::{IceCandidate, SessionDescription};
use parley_media::audio::AudioFrame;
use parley_media::outbound::OutboundTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One decoded frame from an inbound track.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(AudioFrame),
    Video(Vec<u8>),
}

/// A remote track surfaced by the transport.
pub struct InboundTrack {
    pub id: String,
    pub kind: TrackKind,
    pub frames: mpsc::Receiver<MediaFrame>,
}

impl fmt::Debug for InboundTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Peer connection state as reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum TransportEvent {
    Track(InboundTrack),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    /// Locally gathered candidate to trickle to the remote side.
    LocalCandidate(IceCandidate),
}

impl TransportEvent {
    /// Whether this event means the media path is gone for good.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionState(PeerConnectionState::Failed)
                | Self::IceConnectionState(IceConnectionState::Failed)
        )
    }
}

/// A negotiated media session.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()>;

    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;

    /// Tear the session down. Closing an already-closed session is not an error.
    async fn close(&self) -> anyhow::Result<()>;
}

/// What the agent hands the media engine when a session is created.
pub struct TransportSetup {
    pub ice_servers: Vec<String>,
    /// Polled by the engine at its frame clock for outbound audio.
    pub outbound: OutboundTrack,
}

/// Creates media sessions.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        setup: TransportSetup,
    ) -> anyhow::Result<(Arc<dyn MediaTransport>, mpsc::Receiver<TransportEvent>)>;
}
