//! Conversation state shared across threads.
//!
//! The turn controller is the single writer of the current state; the
//! capture thread reads an eventually-consistent copy through an atomic
//! cell to decide whether resampled frames may be forwarded.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Conversation phases. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Idle; the user may arm the microphone.
    Ready,
    /// Capturing and streaming the candidate's speech.
    Listening,
    /// The interviewer reply is being generated or played; mic is disabled.
    Speaking,
}

impl ConversationState {
    fn as_u8(self) -> u8 {
        match self {
            ConversationState::Ready => 0,
            ConversationState::Listening => 1,
            ConversationState::Speaking => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConversationState::Listening,
            2 => ConversationState::Speaking,
            _ => ConversationState::Ready,
        }
    }
}

/// Atomic cell holding the current [`ConversationState`].
///
/// Written only by the turn controller; everything else (in particular the
/// audio callback, which cannot observe controller state synchronously)
/// holds a read-only clone.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConversationState::Ready.as_u8())))
    }

    pub fn set(&self, state: ConversationState) {
        self.0.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn get(&self) -> ConversationState {
        ConversationState::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn is_listening(&self) -> bool {
        self.get() == ConversationState::Listening
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_round_trips_all_states() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConversationState::Ready);

        for state in [
            ConversationState::Listening,
            ConversationState::Speaking,
            ConversationState::Ready,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn clones_share_the_same_cell() {
        let cell = StateCell::new();
        let reader = cell.clone();
        cell.set(ConversationState::Listening);
        assert!(reader.is_listening());
        cell.set(ConversationState::Speaking);
        assert!(!reader.is_listening());
    }
}
