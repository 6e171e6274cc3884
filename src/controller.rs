//! Turn controller - conversation state machine.
//!
//! Pure, synchronous core of the voice loop: events go in through
//! [`TurnController::on_event`], side effects come out as queued
//! [`Action`]s drained by the session runner. All I/O (timers, sockets,
//! HTTP, playback) lives in the runner; this module only decides.

use crate::state::{ConversationState, StateCell};
use crate::transcript::UtteranceBuffer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One complete exchange unit, immutable once appended to history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    fn now(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Everything the controller can react to.
#[derive(Debug)]
pub enum Event {
    /// User pressed the mic toggle.
    MicToggle,
    /// Partial (non-final) transcript text for display.
    Partial(String),
    /// Finalized transcript fragment for one ordinal.
    Final { ordinal: u64, text: String },
    /// Upstream end-of-turn signal with its confidence.
    EndOfTurn { confidence: f32 },
    /// The silence timer elapsed without new finalized speech.
    SilenceElapsed,
    /// Interviewer reply text arrived from the generator.
    ReplyText(String),
    /// Reply playback finished (or the reply carried no audio).
    SpeakingDone,
    /// Reply generation failed.
    GenerationFailed(String),
    /// Both playback paths failed.
    PlaybackFailed(String),
    /// The transcription channel errored or closed unexpectedly.
    ChannelError(String),
    /// Session setup failed (mic permission, token, connect).
    SessionFailed(String),
}

/// Side effects requested from the session runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Acquire the microphone, fetch a token, open the channel.
    StartSession,
    /// Tear down mic, channel and capture for the current session.
    StopSession,
    /// Arm (or re-arm) the end-of-turn silence timer.
    ArmSilenceTimer,
    /// Cancel a pending silence timer.
    CancelSilenceTimer,
    /// Submit the assembled utterance for reply generation.
    ///
    /// `history` is the conversation before this utterance; the utterance
    /// itself travels separately so the generator does not see it twice.
    Submit {
        utterance: String,
        history: Vec<ConversationTurn>,
    },
}

/// The conversation state machine.
///
/// Owns the shared [`StateCell`] and is its only writer; the capture thread
/// reads the cell to drop frames produced outside of Listening.
pub struct TurnController {
    cell: StateCell,
    utterance: UtteranceBuffer,
    partial: String,
    history: Vec<ConversationTurn>,
    error: Option<String>,
    end_of_turn_confidence: f32,
    actions: Vec<Action>,
}

impl TurnController {
    pub fn new(end_of_turn_confidence: f32) -> Self {
        Self {
            cell: StateCell::new(),
            utterance: UtteranceBuffer::new(),
            partial: String::new(),
            history: Vec::new(),
            error: None,
            end_of_turn_confidence,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.cell.get()
    }

    /// Read-only handle on the shared state cell for the capture side.
    pub fn state_cell(&self) -> StateCell {
        self.cell.clone()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// The utterance accumulated so far in this listening session.
    pub fn current_utterance(&self) -> String {
        self.utterance.assemble()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Append an assistant turn outside the reply flow (session greeting).
    pub fn append_assistant(&mut self, content: &str) {
        self.history
            .push(ConversationTurn::now(Role::Assistant, content.to_string()));
    }

    /// Drop history, partials and errors; tears down a live session first.
    pub fn clear(&mut self) {
        if self.state() == ConversationState::Listening {
            self.actions.push(Action::CancelSilenceTimer);
            self.actions.push(Action::StopSession);
        }
        self.set_state(ConversationState::Ready);
        self.history.clear();
        self.utterance.clear();
        self.partial.clear();
        self.error = None;
    }

    /// Hand queued side effects to the runner.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn on_event(&mut self, event: Event) {
        match (self.state(), event) {
            // ===== READY =====
            (ConversationState::Ready, Event::MicToggle) => {
                info!("mic toggle: starting listening session");
                self.error = None;
                self.partial.clear();
                self.utterance.clear();
                self.set_state(ConversationState::Listening);
                self.actions.push(Action::StartSession);
            }

            // ===== LISTENING =====
            (ConversationState::Listening, Event::MicToggle) => {
                info!("mic toggle: stopping listening session");
                self.discard_session();
            }
            (ConversationState::Listening, Event::Partial(text)) => {
                debug!("partial transcript: {}", text);
                self.partial = text;
                // Speech is still arriving; the turn must not end under it.
                self.actions.push(Action::CancelSilenceTimer);
            }
            (ConversationState::Listening, Event::Final { ordinal, text }) => {
                debug!("final fragment #{}: {}", ordinal, text);
                self.utterance.merge_final(ordinal, &text);
                self.partial.clear();
                if !self.utterance.is_empty() {
                    self.actions.push(Action::ArmSilenceTimer);
                }
            }
            (ConversationState::Listening, Event::EndOfTurn { confidence }) => {
                if confidence >= self.end_of_turn_confidence && !self.utterance.is_empty() {
                    info!(
                        "end-of-turn signal ({:.2} >= {:.2}), submitting",
                        confidence, self.end_of_turn_confidence
                    );
                    self.submit_utterance();
                } else {
                    debug!("end-of-turn signal below threshold or empty utterance, ignoring");
                }
            }
            (ConversationState::Listening, Event::SilenceElapsed) => {
                if self.utterance.is_empty() {
                    debug!("silence elapsed with empty utterance, staying in Listening");
                } else {
                    info!("silence window elapsed, submitting utterance");
                    self.submit_utterance();
                }
            }

            // ===== SPEAKING =====
            (ConversationState::Speaking, Event::MicToggle) => {
                // Mic is disabled while the interviewer speaks.
                debug!("mic toggle ignored while interviewer is speaking");
            }
            (ConversationState::Speaking, Event::SpeakingDone) => {
                info!("interviewer reply finished, ready to listen");
                self.set_state(ConversationState::Ready);
            }
            (ConversationState::Speaking, Event::GenerationFailed(msg)) => {
                warn!("reply generation failed: {}", msg);
                // The user's turn stays in history; only the reply is lost.
                self.fail(format!("Failed to generate response: {msg}"));
            }
            (ConversationState::Speaking, Event::PlaybackFailed(msg)) => {
                warn!("reply playback failed: {}", msg);
                self.fail(format!("Failed to play audio response: {msg}"));
            }

            // ===== ANY STATE =====
            (_, Event::ReplyText(text)) => {
                // Applied even if an error already forced Ready: in-flight
                // requests are allowed to complete and land in history.
                info!("interviewer: {}", text);
                self.history
                    .push(ConversationTurn::now(Role::Assistant, text));
            }
            (state, Event::ChannelError(msg)) => {
                warn!("transcription channel error in {:?}: {}", state, msg);
                self.actions.push(Action::CancelSilenceTimer);
                self.actions.push(Action::StopSession);
                self.fail(format!("Transcription error: {msg}"));
            }
            (state, Event::SessionFailed(msg)) => {
                warn!("session setup failed in {:?}: {}", state, msg);
                self.actions.push(Action::CancelSilenceTimer);
                self.actions.push(Action::StopSession);
                self.fail(format!("Failed to start listening: {msg}"));
            }

            // Everything else is stale (fragments after teardown, timers
            // racing a submit) and is dropped, not buffered.
            (state, event) => {
                debug!("ignoring {:?} in {:?}", event, state);
            }
        }
    }

    fn submit_utterance(&mut self) {
        let utterance = self.utterance.assemble();
        let history = self.history.clone();
        self.history
            .push(ConversationTurn::now(Role::User, utterance.clone()));
        self.utterance.clear();
        self.partial.clear();
        self.set_state(ConversationState::Speaking);
        self.actions.push(Action::CancelSilenceTimer);
        self.actions.push(Action::StopSession);
        self.actions.push(Action::Submit { utterance, history });
    }

    /// Listening -> Ready without submitting; partial utterance is dropped.
    fn discard_session(&mut self) {
        self.utterance.clear();
        self.partial.clear();
        self.set_state(ConversationState::Ready);
        self.actions.push(Action::CancelSilenceTimer);
        self.actions.push(Action::StopSession);
    }

    fn fail(&mut self, message: String) {
        self.error = Some(message);
        self.utterance.clear();
        self.partial.clear();
        self.set_state(ConversationState::Ready);
    }

    fn set_state(&mut self, state: ConversationState) {
        self.cell.set(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listening_controller() -> TurnController {
        let mut tc = TurnController::new(0.7);
        tc.on_event(Event::MicToggle);
        tc.drain_actions();
        tc
    }

    fn submit_of(actions: &[Action]) -> Option<(&str, usize)> {
        actions.iter().find_map(|a| match a {
            Action::Submit { utterance, history } => Some((utterance.as_str(), history.len())),
            _ => None,
        })
    }

    #[test]
    fn toggle_from_ready_starts_listening() {
        let mut tc = TurnController::new(0.7);
        tc.on_event(Event::MicToggle);
        assert_eq!(tc.state(), ConversationState::Listening);
        assert_eq!(tc.drain_actions(), vec![Action::StartSession]);
        assert!(tc.state_cell().is_listening());
    }

    #[test]
    fn toggle_while_listening_discards_partial_utterance() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "half a thought".into(),
        });
        tc.drain_actions();

        tc.on_event(Event::MicToggle);
        assert_eq!(tc.state(), ConversationState::Ready);
        assert_eq!(
            tc.drain_actions(),
            vec![Action::CancelSilenceTimer, Action::StopSession]
        );
        assert_eq!(tc.current_utterance(), "");
        assert!(tc.history().is_empty());
    }

    #[test]
    fn toggle_is_a_no_op_while_speaking() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "two pointers".into(),
        });
        tc.on_event(Event::SilenceElapsed);
        tc.drain_actions();
        assert_eq!(tc.state(), ConversationState::Speaking);

        tc.on_event(Event::MicToggle);
        assert_eq!(tc.state(), ConversationState::Speaking);
        assert!(tc.drain_actions().is_empty());
    }

    #[test]
    fn partial_updates_display_and_cancels_timer() {
        let mut tc = listening_controller();
        tc.on_event(Event::Partial("two poi".into()));
        assert_eq!(tc.partial(), "two poi");
        assert_eq!(tc.drain_actions(), vec![Action::CancelSilenceTimer]);
    }

    #[test]
    fn final_fragment_arms_timer_and_clears_partial() {
        let mut tc = listening_controller();
        tc.on_event(Event::Partial("two poi".into()));
        tc.drain_actions();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "two pointers".into(),
        });
        assert_eq!(tc.partial(), "");
        assert_eq!(tc.current_utterance(), "two pointers");
        assert_eq!(tc.drain_actions(), vec![Action::ArmSilenceTimer]);
    }

    #[test]
    fn blank_final_fragment_does_not_arm_timer() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "  ".into(),
        });
        assert!(tc.drain_actions().is_empty());
    }

    #[test]
    fn fragments_submit_sorted_with_last_write_winning() {
        let mut tc = listening_controller();
        // Arrival order [2, 1, 2']; assembly must be ordinal-sorted with the
        // revision of ordinal 2 replacing the original.
        tc.on_event(Event::Final {
            ordinal: 2,
            text: "pointer".into(),
        });
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "two".into(),
        });
        tc.on_event(Event::Final {
            ordinal: 2,
            text: "pointers".into(),
        });
        tc.drain_actions();

        tc.on_event(Event::SilenceElapsed);
        let actions = tc.drain_actions();
        let (utterance, _) = submit_of(&actions).expect("submit action");
        assert_eq!(utterance, "two pointers");
    }

    #[test]
    fn silence_with_empty_utterance_keeps_listening() {
        let mut tc = listening_controller();
        tc.on_event(Event::SilenceElapsed);
        assert_eq!(tc.state(), ConversationState::Listening);
        assert!(tc.drain_actions().is_empty());
    }

    #[test]
    fn end_of_turn_signal_respects_confidence_threshold() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "done".into(),
        });
        tc.drain_actions();

        tc.on_event(Event::EndOfTurn { confidence: 0.5 });
        assert_eq!(tc.state(), ConversationState::Listening);
        assert!(tc.drain_actions().is_empty());

        tc.on_event(Event::EndOfTurn { confidence: 0.9 });
        assert_eq!(tc.state(), ConversationState::Speaking);
        assert!(submit_of(&tc.drain_actions()).is_some());
    }

    #[test]
    fn submit_snapshots_history_without_the_new_user_turn() {
        let mut tc = TurnController::new(0.7);
        tc.append_assistant("Welcome to your interview.");
        tc.on_event(Event::MicToggle);
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "two pointers".into(),
        });
        tc.drain_actions();
        tc.on_event(Event::SilenceElapsed);

        let actions = tc.drain_actions();
        let (utterance, history_len) = submit_of(&actions).expect("submit action");
        assert_eq!(utterance, "two pointers");
        // Snapshot holds only the greeting; controller history also has the
        // user's turn.
        assert_eq!(history_len, 1);
        assert_eq!(tc.history().len(), 2);
        assert_eq!(tc.history()[1].role, Role::User);
        assert_eq!(tc.history()[1].content, "two pointers");
    }

    #[test]
    fn full_turn_reaches_ready_with_two_history_entries() {
        let mut tc = TurnController::new(0.7);
        tc.on_event(Event::MicToggle);
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "two pointers".into(),
        });
        tc.on_event(Event::SilenceElapsed);
        assert_eq!(tc.state(), ConversationState::Speaking);

        tc.on_event(Event::ReplyText("Good. Walk me through it.".into()));
        tc.on_event(Event::SpeakingDone);

        assert_eq!(tc.state(), ConversationState::Ready);
        assert_eq!(tc.history().len(), 2);
        assert_eq!(tc.history()[0].role, Role::User);
        assert_eq!(tc.history()[0].content, "two pointers");
        assert_eq!(tc.history()[1].role, Role::Assistant);
        assert_eq!(tc.history()[1].content, "Good. Walk me through it.");
        assert!(tc.error().is_none());
    }

    #[test]
    fn channel_error_tears_down_and_surfaces() {
        let mut tc = listening_controller();
        tc.on_event(Event::ChannelError("socket closed unexpectedly".into()));
        assert_eq!(tc.state(), ConversationState::Ready);
        let actions = tc.drain_actions();
        assert!(actions.contains(&Action::StopSession));
        assert!(actions.contains(&Action::CancelSilenceTimer));
        assert!(tc.error().unwrap().contains("socket closed unexpectedly"));
        assert_eq!(tc.partial(), "");
        assert_eq!(tc.current_utterance(), "");
    }

    #[test]
    fn generation_failure_keeps_the_user_turn() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "hash map".into(),
        });
        tc.on_event(Event::SilenceElapsed);
        tc.drain_actions();

        tc.on_event(Event::GenerationFailed("503".into()));
        assert_eq!(tc.state(), ConversationState::Ready);
        assert!(tc.error().is_some());
        assert_eq!(tc.history().len(), 1);
        assert_eq!(tc.history()[0].role, Role::User);
    }

    #[test]
    fn playback_failure_returns_to_ready() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "hash map".into(),
        });
        tc.on_event(Event::SilenceElapsed);
        tc.on_event(Event::ReplyText("Try an example.".into()));
        tc.drain_actions();

        tc.on_event(Event::PlaybackFailed("unsupported container".into()));
        assert_eq!(tc.state(), ConversationState::Ready);
        assert!(tc.error().is_some());
        // Text reply survives even though its audio did not play.
        assert_eq!(tc.history().len(), 2);
    }

    #[test]
    fn late_reply_after_error_still_lands_in_history() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "sorting".into(),
        });
        tc.on_event(Event::SilenceElapsed);
        tc.drain_actions();

        // Channel error forces Ready while generation is in flight.
        tc.on_event(Event::ChannelError("dropped".into()));
        assert_eq!(tc.state(), ConversationState::Ready);

        tc.on_event(Event::ReplyText("Consider quicksort.".into()));
        assert_eq!(tc.history().len(), 2);
        assert_eq!(tc.history()[1].role, Role::Assistant);
    }

    #[test]
    fn stale_fragments_outside_listening_are_dropped() {
        let mut tc = TurnController::new(0.7);
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "ghost".into(),
        });
        tc.on_event(Event::Partial("ghost".into()));
        tc.on_event(Event::SilenceElapsed);
        assert_eq!(tc.state(), ConversationState::Ready);
        assert!(tc.drain_actions().is_empty());
        assert_eq!(tc.current_utterance(), "");
    }

    #[test]
    fn clear_resets_everything_and_tears_down_a_live_session() {
        let mut tc = listening_controller();
        tc.on_event(Event::Final {
            ordinal: 1,
            text: "hello".into(),
        });
        tc.drain_actions();

        tc.clear();
        assert_eq!(tc.state(), ConversationState::Ready);
        assert!(tc.history().is_empty());
        assert!(tc.error().is_none());
        let actions = tc.drain_actions();
        assert!(actions.contains(&Action::StopSession));
    }

    #[test]
    fn session_failure_surfaces_and_returns_to_ready() {
        let mut tc = TurnController::new(0.7);
        tc.on_event(Event::MicToggle);
        tc.drain_actions();
        tc.on_event(Event::SessionFailed("microphone permission denied".into()));
        assert_eq!(tc.state(), ConversationState::Ready);
        assert!(tc.error().unwrap().contains("permission denied"));
    }
}
