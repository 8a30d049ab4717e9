//! Observer notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use parley_core::types::SessionState;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 64;

/// Events emitted by a voice agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// A legal state transition happened.
    #[serde(rename = "state_changed")]
    StateChanged {
        previous: SessionState,
        state: SessionState,
    },

    /// A non-empty transcript of the user's utterance.
    #[serde(rename = "transcript")]
    Transcript { text: String },

    /// A generated reply (not the fallback text).
    #[serde(rename = "reply")]
    Reply { text: String },
}

/// Fan-out of [`AgentEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is fine.
    pub fn emit(&self, event: AgentEvent) {
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(receivers, "Agent event");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
