//! Session runner - connects capture, channel, controller and playback.
//!
//! Owns the event loop: commands from the UI, transcript events from the
//! channel, the silence timer and reply-task notifications all funnel into
//! the [`TurnController`], whose queued actions are executed here. The
//! microphone, socket and capture thread for one listening session are
//! owned exclusively by this runner and torn down together.

use crate::capture::{self, CaptureHandle, CaptureStopper};
use crate::channel::{fetch_token, ChannelEvent, ChannelError, TranscriptionChannel};
use crate::config::SessionConfig;
use crate::controller::{Action, Event, TurnController};
use crate::generate::{GenerateError, GenerateRequest, ReplyClient};
use crate::playback::{self, PlaybackError};
use crate::state::StateCell;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("microphone error: {0}")]
    Capture(#[from] capture::CaptureError),

    #[error("transcription channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("reply generation error: {0}")]
    Generation(#[from] GenerateError),

    #[error("audio playback error: {0}")]
    Playback(#[from] PlaybackError),
}

/// Commands from the user-facing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Toggle the microphone (no-op while the interviewer is speaking).
    ToggleMic,
    /// Drop history and partial state, tearing down any live session.
    Clear,
    /// Tear down and exit the run loop.
    Shutdown,
}

/// One-shot silence timer. Re-arming replaces the pending deadline, so the
/// timer fires at most once per quiet period.
#[derive(Default)]
struct SilenceTimer {
    deadline: Option<Pin<Box<Sleep>>>,
}

impl SilenceTimer {
    fn arm(&mut self, window: Duration) {
        self.deadline = Some(Box::pin(sleep(window)));
    }

    fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Resolves once when the armed deadline passes; disarmed afterwards.
    /// Returns `None` immediately when no deadline is armed.
    async fn fired(&mut self) -> Option<()> {
        match self.deadline.as_mut() {
            Some(deadline) => {
                deadline.await;
                self.deadline = None;
                Some(())
            }
            None => None,
        }
    }
}

/// Resources of one live listening session, torn down as a unit.
struct LiveSession {
    stopper: CaptureStopper,
    channel: Arc<TranscriptionChannel>,
    pump: JoinHandle<()>,
    forward: JoinHandle<()>,
}

/// The session runner. Construct, then drive with [`SessionRunner::run`].
pub struct SessionRunner {
    cfg: SessionConfig,
    controller: TurnController,
    http: reqwest::Client,
    reply: ReplyClient,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    silence: SilenceTimer,
    live: Option<LiveSession>,
}

impl SessionRunner {
    pub fn new(cfg: SessionConfig) -> Self {
        let http = reqwest::Client::new();
        let reply = ReplyClient::new(http.clone(), cfg.generate_url());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut controller = TurnController::new(cfg.end_of_turn_confidence);
        controller.append_assistant(&greeting(&cfg));

        Self {
            cfg,
            controller,
            http,
            reply,
            events_tx,
            events_rx,
            silence: SilenceTimer::default(),
            live: None,
        }
    }

    pub fn controller(&self) -> &TurnController {
        &self.controller
    }

    /// Drive the session until [`Command::Shutdown`] (or the command channel
    /// closing).
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("session runner started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::ToggleMic) => self.controller.on_event(Event::MicToggle),
                    Some(Command::Clear) => {
                        self.controller.clear();
                        self.controller.append_assistant(&greeting(&self.cfg));
                    }
                    Some(Command::Shutdown) | None => {
                        self.stop_listening().await;
                        info!("session runner shutting down");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.controller.on_event(event),
                Some(()) = self.silence.fired() => {
                    self.controller.on_event(Event::SilenceElapsed);
                }
            }
            self.apply_actions().await;
        }
    }

    /// Execute queued controller actions, feeding any events they raise
    /// (setup failures) back through the controller until it settles.
    async fn apply_actions(&mut self) {
        loop {
            let actions = self.controller.drain_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match action {
                    Action::StartSession => self.start_listening().await,
                    Action::StopSession => self.stop_listening().await,
                    Action::ArmSilenceTimer => self.silence.arm(self.cfg.silence_window()),
                    Action::CancelSilenceTimer => self.silence.cancel(),
                    Action::Submit { utterance, history } => {
                        println!("you: {utterance}");
                        self.spawn_reply(utterance, history);
                    }
                }
            }
        }
    }

    async fn start_listening(&mut self) {
        match self.open_session().await {
            Ok(live) => {
                info!("🎤 listening session open");
                self.live = Some(live);
            }
            Err(e) => {
                self.controller.on_event(Event::SessionFailed(e.to_string()));
            }
        }
    }

    async fn open_session(&mut self) -> Result<LiveSession, SessionError> {
        let token = fetch_token(&self.http, &self.cfg).await?;
        let (channel, channel_rx) = TranscriptionChannel::connect(&self.cfg, &token.token).await?;
        let channel = Arc::new(channel);

        let gate = self.controller.state_cell();
        let cfg = self.cfg.clone();
        let capture =
            tokio::task::spawn_blocking(move || capture::start(&cfg, gate))
                .await
                .map_err(|e| capture::CaptureError::Backend(e.to_string()))??;

        let stopper = capture.stopper();
        let pump = tokio::spawn(pump_frames(
            capture,
            channel.clone(),
            self.controller.state_cell(),
        ));
        let forward = tokio::spawn(forward_events(channel_rx, self.events_tx.clone()));

        Ok(LiveSession {
            stopper,
            channel,
            pump,
            forward,
        })
    }

    /// Tear down the live session. Idempotent: safe to call repeatedly and
    /// when nothing is live.
    async fn stop_listening(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        info!("tearing down listening session");
        // Stop the event forwarder first so a close echo from our own
        // Terminate is not surfaced as an error.
        live.forward.abort();
        live.stopper.stop();
        live.channel.close().await;
        live.pump.abort();
        self.silence.cancel();
    }

    /// Run reply generation and playback off the main loop. Outcomes come
    /// back as controller events. In-flight requests are deliberately not
    /// cancelled by a later teardown; a completed reply still lands in
    /// history.
    fn spawn_reply(&mut self, utterance: String, history: Vec<crate::controller::ConversationTurn>) {
        let reply = self.reply.clone();
        let events = self.events_tx.clone();
        let problem_context = self.cfg.problem_context.clone();
        let language = self.cfg.language.clone();

        tokio::spawn(async move {
            let request = GenerateRequest {
                user_input: &utterance,
                conversation_history: &history,
                problem_context: problem_context.as_ref(),
                current_code: None,
                language: &language,
            };
            match reply.generate(&request).await {
                Ok(r) => {
                    println!("interviewer: {}", r.text);
                    let _ = events.send(Event::ReplyText(r.text));
                    match r.audio {
                        Some(bytes) => {
                            let played =
                                tokio::task::spawn_blocking(move || playback::play_blocking(&bytes))
                                    .await;
                            match played {
                                Ok(Ok(())) => {
                                    let _ = events.send(Event::SpeakingDone);
                                }
                                Ok(Err(e)) => {
                                    let _ = events.send(Event::PlaybackFailed(e.to_string()));
                                }
                                Err(e) => {
                                    let _ = events.send(Event::PlaybackFailed(e.to_string()));
                                }
                            }
                        }
                        None => {
                            debug!("reply carried no audio, skipping playback");
                            let _ = events.send(Event::SpeakingDone);
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(Event::GenerationFailed(e.to_string()));
                }
            }
        });
    }
}

/// Forward resampled frames to the socket while the conversation is
/// Listening. Ends when the capture thread exits or the socket rejects a
/// send.
async fn pump_frames(mut capture: CaptureHandle, channel: Arc<TranscriptionChannel>, gate: StateCell) {
    while let Some(frame) = capture.next_frame().await {
        if !gate.is_listening() {
            continue;
        }
        if let Err(e) = channel.send_frame(frame).await {
            warn!("frame send failed, stopping pump: {}", e);
            break;
        }
    }
    debug!("frame pump finished");
}

/// Map channel events onto controller events. A `Final` carrying an
/// end-of-turn signal produces the fragment first, then the signal, so the
/// utterance is complete when the controller decides.
async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<ChannelEvent>,
    tx: mpsc::UnboundedSender<Event>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            ChannelEvent::Begin { id, expires_at } => {
                info!("transcription session {} open (expires {:?})", id, expires_at);
            }
            ChannelEvent::Partial { text } => {
                if !text.is_empty() && tx.send(Event::Partial(text)).is_err() {
                    break;
                }
            }
            ChannelEvent::Final {
                ordinal,
                text,
                end_of_turn,
                confidence,
            } => {
                if tx.send(Event::Final { ordinal, text }).is_err() {
                    break;
                }
                if end_of_turn && tx.send(Event::EndOfTurn { confidence }).is_err() {
                    break;
                }
            }
            ChannelEvent::Termination => {
                debug!("transcription session terminated by server");
            }
            ChannelEvent::Closed { clean } => {
                if !clean {
                    let _ = tx.send(Event::ChannelError(
                        "transcription socket closed unexpectedly".to_string(),
                    ));
                }
                break;
            }
            ChannelEvent::Error(msg) => {
                let _ = tx.send(Event::ChannelError(msg));
                break;
            }
        }
    }
}

fn greeting(cfg: &SessionConfig) -> String {
    let problem = cfg
        .problem_context
        .as_ref()
        .and_then(|ctx| ctx.get("title"))
        .and_then(|t| t.as_str());
    match problem {
        Some(title) => format!(
            "Welcome to your coding interview! We'll be working through \"{title}\" today. \
             To get started, walk me through your initial thoughts on the problem."
        ),
        None => "Welcome to your coding interview! To get started, walk me through your \
                 initial thoughts on how you might approach the problem."
            .to_string(),
    }
}
