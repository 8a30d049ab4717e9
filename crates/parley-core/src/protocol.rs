//! Room signaling wire protocol.
//!
//! Every message on the signaling channel is a JSON object with a `type`
//! tag and a tag-specific `data` payload:
//!
//! ```json
//! {"type": "answer", "data": {"sdp": "v=0...", "type": "answer"}}
//! ```
//!
//! Decoding is closed: unknown tags and malformed payloads are rejected at
//! the deserialization boundary.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// A signaling frame exchanged with the room server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalingMessage {
    /// Server -> agent session offer.
    #[serde(rename = "offer")]
    Offer(SessionDescription),

    /// Answer to an offer (agent -> server, or server -> agent when the agent initiates).
    #[serde(rename = "answer")]
    Answer(SessionDescription),

    /// Trickled ICE candidate, either direction.
    #[serde(rename = "candidate")]
    Candidate(IceCandidate),

    /// Another participant left the room.
    #[serde(rename = "client-left")]
    PeerLeft(PeerLeft),
}

impl SignalingMessage {
    /// Decode a text frame. Unknown tags are an error.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AgentError::Signaling(format!("undecodable signaling message: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::PeerLeft(_) => "client-left",
        }
    }
}

/// SDP type carried next to the session description body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLeft {
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
}
