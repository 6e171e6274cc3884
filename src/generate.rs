//! Reply-generation client.
//!
//! One request per completed user turn: the utterance, the conversation so
//! far and optional problem/code context go to the interview endpoint, which
//! answers with the interviewer's text and (usually) synthesized speech.

use crate::controller::ConversationTurn;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Stand-in reply when the endpoint returns no usable text.
pub const FALLBACK_REPLY: &str = "I understand. Please continue.";

/// Error type for reply generation.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generate endpoint returned {0}")]
    Status(reqwest::StatusCode),

    #[error("reply audio is not valid base64: {0}")]
    Audio(#[from] base64::DecodeError),
}

/// Request body for the interview endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest<'a> {
    pub user_input: &'a str,
    pub conversation_history: &'a [ConversationTurn],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem_context: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_code: Option<&'a str>,
    pub language: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    text: Option<String>,
    /// Base64-encoded playable audio container, if TTS succeeded upstream.
    #[serde(default)]
    audio: Option<String>,
}

/// The interviewer's reply: text always, audio when TTS succeeded.
#[derive(Debug, Clone)]
pub struct InterviewerReply {
    pub text: String,
    pub audio: Option<Vec<u8>>,
}

/// HTTP client for the reply generator.
#[derive(Debug, Clone)]
pub struct ReplyClient {
    http: reqwest::Client,
    url: String,
}

impl ReplyClient {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest<'_>,
    ) -> Result<InterviewerReply, GenerateError> {
        let resp = self.http.post(&self.url).json(request).send().await?;
        if !resp.status().is_success() {
            return Err(GenerateError::Status(resp.status()));
        }
        let body: GenerateResponse = resp.json().await?;

        let text = body
            .text
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_REPLY.to_string());

        let audio = match body.audio {
            Some(b64) => {
                let bytes = BASE64.decode(b64.as_bytes())?;
                debug!("reply audio: {} bytes", bytes.len());
                Some(bytes)
            }
            None => None,
        };

        Ok(InterviewerReply { text, audio })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Role, TurnController};

    #[test]
    fn request_serializes_camel_case_and_skips_absent_context() {
        let mut tc = TurnController::new(0.7);
        tc.append_assistant("Welcome.");
        let req = GenerateRequest {
            user_input: "two pointers",
            conversation_history: tc.history(),
            problem_context: None,
            current_code: None,
            language: "python",
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["userInput"], "two pointers");
        assert_eq!(value["language"], "python");
        assert_eq!(value["conversationHistory"][0]["role"], "assistant");
        assert!(value["conversationHistory"][0]["timestamp"].is_i64());
        assert!(value.get("problemContext").is_none());
        assert!(value.get("currentCode").is_none());
    }

    #[test]
    fn history_roles_serialize_lowercase() {
        assert_eq!(serde_json::to_value(Role::User).unwrap(), "user");
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap(), "assistant");
    }

    #[test]
    fn response_audio_decodes_from_base64() {
        let body: GenerateResponse =
            serde_json::from_str(r#"{"text":"Good start.","audio":"AQID"}"#).unwrap();
        assert_eq!(body.text.as_deref(), Some("Good start."));
        let bytes = BASE64.decode(body.audio.unwrap().as_bytes()).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn response_tolerates_missing_fields() {
        let body: GenerateResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(body.text.is_none());
        assert!(body.audio.is_none());
        assert_eq!(
            body.text
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| FALLBACK_REPLY.to_string()),
            FALLBACK_REPLY
        );
    }
}
