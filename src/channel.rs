//! Streaming transcription channel client.
//!
//! Speaks the provider's bidirectional socket protocol: outbound raw binary
//! PCM frames plus a `Terminate` control message on shutdown, inbound JSON
//! transcript events. A reader task feeds parsed events into an mpsc channel
//! so the session runner can select on them alongside everything else.

use crate::config::SessionConfig;
use crate::resampler::{AudioFrame, TARGET_SAMPLE_RATE};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Close codes treated as a clean shutdown rather than a channel fault.
const CLEAN_CLOSE_CODES: [u16; 3] = [1000, 1001, 1005];

type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Error type for transcription channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token provider returned {0}")]
    TokenStatus(reqwest::StatusCode),
}

/// Short-lived credential for opening the transcription socket.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionToken {
    pub token: String,
    /// Seconds until the credential expires (~480 s).
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Fetch a session token from the interview server. Invoked once per
/// listening session, right before the socket is opened.
pub async fn fetch_token(
    http: &reqwest::Client,
    cfg: &SessionConfig,
) -> Result<SessionToken, ChannelError> {
    let resp = http.post(cfg.token_url()).send().await?;
    if !resp.status().is_success() {
        return Err(ChannelError::TokenStatus(resp.status()));
    }
    let token: SessionToken = resp.json().await?;
    if let Some(secs) = token.expires_in {
        debug!("transcription token expires in {}s", secs);
    }
    Ok(token)
}

/// Parsed inbound events.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Session established on the provider side.
    Begin {
        id: String,
        expires_at: Option<u64>,
    },
    /// In-progress recognition text; replaced by the next partial or final.
    Partial { text: String },
    /// Finalized text for one utterance segment.
    Final {
        ordinal: u64,
        text: String,
        end_of_turn: bool,
        confidence: f32,
    },
    /// Server acknowledged our Terminate message.
    Termination,
    /// Socket closed; `clean` distinguishes expected shutdown codes.
    Closed { clean: bool },
    /// Transport-level failure.
    Error(String),
}

/// Inbound wire shapes. The provider has shipped two generations of event
/// schema; both are tolerated ("text" vs "transcript" payload keys).
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    Begin {
        id: String,
        #[serde(default)]
        expires_at: Option<u64>,
    },
    PartialTranscript {
        #[serde(default, alias = "transcript")]
        text: String,
    },
    Turn {
        #[serde(default, alias = "text")]
        transcript: String,
        #[serde(default)]
        turn_order: u64,
        #[serde(default)]
        end_of_turn: bool,
        #[serde(default)]
        end_of_turn_confidence: f32,
    },
    Termination {},
}

fn parse_event(text: &str) -> Option<ChannelEvent> {
    match serde_json::from_str::<WireEvent>(text) {
        Ok(WireEvent::Begin { id, expires_at }) => Some(ChannelEvent::Begin { id, expires_at }),
        Ok(WireEvent::PartialTranscript { text }) => Some(ChannelEvent::Partial { text }),
        Ok(WireEvent::Turn {
            transcript,
            turn_order,
            end_of_turn,
            end_of_turn_confidence,
        }) => Some(ChannelEvent::Final {
            ordinal: turn_order,
            text: transcript,
            end_of_turn,
            confidence: end_of_turn_confidence,
        }),
        Ok(WireEvent::Termination {}) => Some(ChannelEvent::Termination),
        Err(e) => {
            debug!("ignoring unrecognized channel message: {} ({})", text, e);
            None
        }
    }
}

/// Handle on one open transcription socket.
///
/// Sending and closing go through the shared sink; inbound traffic arrives
/// on the receiver returned by [`TranscriptionChannel::connect`].
pub struct TranscriptionChannel {
    sink: WsSink,
    _reader: JoinHandle<()>,
}

impl TranscriptionChannel {
    /// Open the socket and spawn the reader task.
    pub async fn connect(
        cfg: &SessionConfig,
        token: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let url = format!(
            "{}?sample_rate={}&formatted_finals=true&token={}",
            cfg.socket_url, TARGET_SAMPLE_RATE, token
        );
        info!("connecting to transcription channel");
        let (ws, _resp) = connect_async(&url).await?;
        let (sink, stream) = ws.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(stream, tx));

        Ok((
            Self {
                sink: Arc::new(Mutex::new(sink)),
                _reader: reader,
            },
            rx,
        ))
    }

    /// Send one PCM frame. Frames go out in capture order; the sink mutex
    /// serializes concurrent senders.
    pub async fn send_frame(&self, frame: AudioFrame) -> Result<(), ChannelError> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame.into_bytes().into()))
            .await?;
        Ok(())
    }

    /// Send the Terminate handshake and close the socket.
    ///
    /// Errors are swallowed: the socket may already be gone, and teardown
    /// must succeed regardless.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let terminate = json!({"type": "Terminate"}).to_string();
        if let Err(e) = sink.send(Message::Text(terminate.into())).await {
            debug!("terminate message not delivered: {}", e);
        }
        if let Err(e) = sink.close().await {
            debug!("socket close failed: {}", e);
        }
    }
}

async fn read_loop(mut stream: WsStream, tx: mpsc::UnboundedSender<ChannelEvent>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(event) = parse_event(&text) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                let clean = frame
                    .map(|f| CLEAN_CLOSE_CODES.contains(&u16::from(f.code)))
                    .unwrap_or(true);
                if !clean {
                    warn!("transcription socket closed unexpectedly");
                }
                let _ = tx.send(ChannelEvent::Closed { clean });
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(ChannelEvent::Error(e.to_string()));
                break;
            }
        }
    }
    debug!("channel reader task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_transcript_shape() {
        let event = parse_event(r#"{"type":"PartialTranscript","text":"two poi"}"#).unwrap();
        match event {
            ChannelEvent::Partial { text } => assert_eq!(text, "two poi"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_turn_shape_with_ordinal_and_signal() {
        let event = parse_event(
            r#"{"type":"Turn","transcript":"two pointers","turn_order":2,
                "end_of_turn":true,"end_of_turn_confidence":0.92}"#,
        )
        .unwrap();
        match event {
            ChannelEvent::Final {
                ordinal,
                text,
                end_of_turn,
                confidence,
            } => {
                assert_eq!(ordinal, 2);
                assert_eq!(text, "two pointers");
                assert!(end_of_turn);
                assert!((confidence - 0.92).abs() < 1e-6);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn turn_shape_tolerates_text_key_and_missing_fields() {
        let event = parse_event(r#"{"type":"Turn","text":"hello"}"#).unwrap();
        match event {
            ChannelEvent::Final {
                ordinal,
                text,
                end_of_turn,
                ..
            } => {
                assert_eq!(ordinal, 0);
                assert_eq!(text, "hello");
                assert!(!end_of_turn);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_begin_and_termination() {
        match parse_event(r#"{"type":"Begin","id":"abc","expires_at":1730000000}"#).unwrap() {
            ChannelEvent::Begin { id, expires_at } => {
                assert_eq!(id, "abc");
                assert_eq!(expires_at, Some(1_730_000_000));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            parse_event(r#"{"type":"Termination","audio_duration_seconds":12.5}"#),
            Some(ChannelEvent::Termination)
        ));
    }

    #[test]
    fn unknown_message_types_are_ignored() {
        assert!(parse_event(r#"{"type":"Heartbeat"}"#).is_none());
        assert!(parse_event("not json").is_none());
    }
}
