//! vivavoce - voice client for mock coding interviews.
//!
//! Thin wiring around the library: parse flags, start the session runner,
//! and translate stdin into commands. Press Enter to toggle the microphone,
//! type `clear` to reset the conversation, `quit` to exit.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vivavoce::{Command, SessionConfig, SessionRunner};

#[derive(Debug, Parser)]
#[command(name = "vivavoce", about = "Voice client for mock coding interviews")]
struct Args {
    /// Base URL of the interview server (token + reply endpoints).
    #[arg(long, default_value = "http://localhost:3000")]
    api_base: String,

    /// WebSocket endpoint of the streaming transcription service.
    #[arg(long, default_value = "wss://streaming.assemblyai.com/v3/ws")]
    socket_url: String,

    /// Native sample rate to request from the microphone.
    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,

    /// Milliseconds of silence after a final fragment before the turn ends.
    #[arg(long, default_value_t = 3_000)]
    silence_ms: u64,

    /// Minimum confidence for an upstream end-of-turn signal.
    #[arg(long, default_value_t = 0.7)]
    eot_confidence: f32,

    /// Language the candidate is coding in.
    #[arg(long, default_value = "python")]
    language: String,

    /// JSON file with the problem description forwarded to the interviewer.
    #[arg(long)]
    problem_file: Option<String>,

    /// PulseAudio source name (defaults to the system input device).
    #[arg(long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let problem_context = match &args.problem_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read problem file {path}"))?;
            Some(serde_json::from_str(&raw).context("problem file is not valid JSON")?)
        }
        None => None,
    };

    let cfg = SessionConfig {
        api_base: args.api_base,
        socket_url: args.socket_url,
        source_sample_rate: args.sample_rate,
        silence_window_ms: args.silence_ms,
        end_of_turn_confidence: args.eot_confidence,
        language: args.language,
        problem_context,
        device: args.device,
    };

    info!("starting vivavoce against {}", cfg.api_base);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let runner = SessionRunner::new(cfg);
    let runner_task = tokio::spawn(runner.run(command_rx));

    println!("Enter: toggle microphone | clear: reset conversation | quit: exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => command_tx.send(Command::ToggleMic)?,
            "clear" => command_tx.send(Command::Clear)?,
            "quit" | "q" => {
                command_tx.send(Command::Shutdown)?;
                break;
            }
            other => println!("unrecognized input: {other:?}"),
        }
    }

    drop(command_tx);
    runner_task.await?;
    Ok(())
}
