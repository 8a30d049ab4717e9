//! Session state machine.

use std::sync::Mutex;

use tracing::{debug, info};

use parley_core::types::SessionState;

use crate::events::{AgentEvent, EventBus};

/// Single source of truth for the agent lifecycle.
///
/// Check, update, and notification happen under one lock, so observers see
/// transitions in the order they were applied.
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<SessionState>,
    events: EventBus,
}

impl StateMachine {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(SessionState::Disconnected),
            events,
        }
    }

    pub fn current(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `next` if it is a legal edge from the current state.
    ///
    /// Returns `true` and fires one [`AgentEvent::StateChanged`] on success.
    /// Illegal and same-state requests are ignored and return `false`.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *state;
        if !previous.can_transition_to(next) {
            debug!(from = %previous, to = %next, "Ignoring state transition");
            return false;
        }
        *state = next;
        info!(from = %previous, state = %next, "State changed");
        self.events.emit(AgentEvent::StateChanged {
            previous,
            state: next,
        });
        true
    }

    /// Whether inbound frames should be run through VAD right now.
    pub fn is_listening(&self, mute_while_speaking: bool) -> bool {
        match self.current() {
            SessionState::Connected => true,
            SessionState::Speaking => !mute_while_speaking,
            _ => false,
        }
    }
}
