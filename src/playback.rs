//! Reply audio playback.
//!
//! The primary path hands the bytes to rodio's container decoder. If that
//! fails (the TTS provider sometimes returns raw PCM wrapped in a minimal
//! WAV header that trips the decoder), the bytes are re-read as a WAV
//! stream via hound and played as raw samples before giving up.

use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, Sink};
use std::io::Cursor;
use tracing::{debug, warn};

/// Error type for playback operations.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("no audio output device: {0}")]
    Device(#[from] rodio::StreamError),

    #[error("audio sink error: {0}")]
    Sink(#[from] rodio::PlayError),

    #[error("audio is not decodable as a container or as WAV: {0}")]
    Wav(#[from] hound::Error),
}

/// Play the reply audio to completion. Blocks the calling thread; the
/// session runner wraps this in `spawn_blocking` and treats the returned
/// future as the "playback finished" notification.
pub fn play_blocking(bytes: &[u8]) -> Result<(), PlaybackError> {
    let (_stream, handle) = OutputStream::try_default()?;
    let sink = Sink::try_new(&handle)?;

    match Decoder::new(Cursor::new(bytes.to_vec())) {
        Ok(source) => {
            debug!("playing reply via container decoder");
            sink.append(source);
        }
        Err(e) => {
            warn!("container decode failed ({}), retrying as raw WAV", e);
            sink.append(decode_wav(bytes)?);
        }
    }

    sink.sleep_until_end();
    Ok(())
}

/// Fallback decode: parse the bytes as a WAV stream and hand the raw
/// samples straight to the output.
fn decode_wav(bytes: &[u8]) -> Result<SamplesBuffer<i16>, PlaybackError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<i16>, hound::Error>>()?;
    debug!(
        "raw WAV fallback: {} Hz, {} ch, {} samples",
        spec.sample_rate,
        spec.channels,
        samples.len()
    );
    Ok(SamplesBuffer::new(spec.channels, spec.sample_rate, samples))
}
