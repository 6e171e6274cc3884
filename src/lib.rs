//! vivavoce - voice client for a mock coding-interview service
//!
//! The candidate speaks into the microphone; audio is resampled to 16 kHz
//! 16-bit PCM and streamed over a WebSocket to a hosted transcription
//! service. Finalized transcript fragments are accumulated into an
//! utterance, and once the candidate falls silent the utterance is sent to
//! an interview endpoint which returns the interviewer's reply as text plus
//! synthesized speech. The reply is played back locally, after which the
//! session is ready to listen again.

pub mod capture;
pub mod channel;
pub mod config;
pub mod controller;
pub mod generate;
pub mod playback;
pub mod resampler;
pub mod session;
pub mod state;
pub mod transcript;

pub use capture::{CaptureHandle, CaptureStrategy};
pub use channel::{ChannelEvent, TranscriptionChannel};
pub use config::SessionConfig;
pub use controller::{Action, ConversationTurn, Event, Role, TurnController};
pub use generate::{InterviewerReply, ReplyClient};
pub use resampler::{AudioFrame, Resampler};
pub use session::{Command, SessionRunner};
pub use state::{ConversationState, StateCell};
