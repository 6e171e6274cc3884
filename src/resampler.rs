//! Microphone resampling and framing.
//!
//! Converts the native-rate float stream delivered by a capture backend into
//! 16 kHz 16-bit mono PCM frames sized for the streaming transcription
//! socket. Decimation is nearest-lower-neighbor with no anti-aliasing
//! filter; latency is favored over fidelity since the consumer is a speech
//! recognizer, not a human ear.

/// Sample rate expected by the transcription service.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Buffered input samples required before a frame is produced.
pub const FRAME_SAMPLES: usize = 1024;

/// Source rates within this distance of the target skip decimation.
pub const RATE_TOLERANCE_HZ: u32 = 100;

/// One frame of 16 kHz mono PCM, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Consume the frame into little-endian bytes for the socket.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }
}

/// Accumulates native-rate float samples and emits fixed-format frames.
///
/// Samples left over after a frame is cut (the tail shorter than one output
/// step) stay buffered for the next call, so nothing is dropped at chunk
/// boundaries.
#[derive(Debug)]
pub struct Resampler {
    source_rate: u32,
    ratio: f64,
    passthrough: bool,
    buffer: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32) -> Self {
        let passthrough = source_rate.abs_diff(TARGET_SAMPLE_RATE) <= RATE_TOLERANCE_HZ;
        Self {
            source_rate,
            ratio: f64::from(source_rate) / f64::from(TARGET_SAMPLE_RATE),
            passthrough,
            buffer: Vec::new(),
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Number of samples currently carried over between calls.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Push one chunk of samples in `[-1.0, 1.0]`.
    ///
    /// Returns a frame once at least [`FRAME_SAMPLES`] inputs have
    /// accumulated; otherwise `None`. An empty chunk never produces a frame
    /// and leaves the buffer untouched.
    pub fn push(&mut self, chunk: &[f32]) -> Option<AudioFrame> {
        if chunk.is_empty() {
            return None;
        }
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() < FRAME_SAMPLES {
            return None;
        }

        if self.passthrough {
            let samples = self.buffer.drain(..).map(quantize).collect();
            return Some(AudioFrame { samples });
        }

        let out_len = (self.buffer.len() as f64 / self.ratio) as usize;
        if out_len == 0 {
            return None;
        }

        let mut samples = Vec::with_capacity(out_len);
        for i in 0..out_len {
            let src = (i as f64 * self.ratio) as usize;
            samples.push(quantize(self.buffer[src]));
        }

        let consumed = ((out_len as f64) * self.ratio) as usize;
        self.buffer.drain(..consumed.min(self.buffer.len()));

        Some(AudioFrame { samples })
    }
}

/// Clamp to `[-1.0, 1.0]` before scaling so out-of-range input saturates
/// instead of wrapping around in i16.
fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}
