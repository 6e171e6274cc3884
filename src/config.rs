//! Session configuration.

use std::time::Duration;

/// Configuration for one interview session.
///
/// `api_base` points at the server that fronts the token and reply
/// endpoints; `socket_url` is the streaming transcription service itself.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the interview server (token provider + reply generator).
    pub api_base: String,
    /// WebSocket endpoint of the streaming transcription service.
    pub socket_url: String,
    /// Native sample rate requested from the microphone.
    pub source_sample_rate: u32,
    /// Sustained silence after a final fragment before the turn ends.
    pub silence_window_ms: u64,
    /// Minimum confidence for an upstream end-of-turn signal to be honored.
    pub end_of_turn_confidence: f32,
    /// Language the candidate is coding in, forwarded to the interviewer.
    pub language: String,
    /// Opaque problem description forwarded to the reply generator.
    pub problem_context: Option<serde_json::Value>,
    /// PulseAudio source name; `None` uses the default input device.
    pub device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000".to_string(),
            socket_url: "wss://streaming.assemblyai.com/v3/ws".to_string(),
            source_sample_rate: 48_000,
            silence_window_ms: 3_000,
            end_of_turn_confidence: 0.7,
            language: "python".to_string(),
            problem_context: None,
            device: None,
        }
    }
}

impl SessionConfig {
    pub fn silence_window(&self) -> Duration {
        Duration::from_millis(self.silence_window_ms)
    }

    pub fn token_url(&self) -> String {
        format!("{}/api/transcribe/token", self.api_base.trim_end_matches('/'))
    }

    pub fn generate_url(&self) -> String {
        format!(
            "{}/api/interview/generate",
            self.api_base.trim_end_matches('/')
        )
    }
}
