//! Microphone capture strategies.
//!
//! Two interchangeable producers feed the resampler: a callback-driven
//! PulseAudio threaded-mainloop stream (preferred, runs on its own
//! real-time schedule) and a blocking Simple-API poll loop (fallback).
//! Both run on a dedicated OS thread, capture mono float samples at the
//! device's native rate, push them through a [`Resampler`] and deliver
//! ready-to-send 16 kHz frames over an mpsc channel. Frames produced while
//! the conversation is not Listening are dropped at the source: the thread
//! reads the shared [`StateCell`] (an eventually-consistent copy of the
//! controller's state) before enqueueing.

use crate::config::SessionConfig;
use crate::resampler::{AudioFrame, Resampler};
use crate::state::StateCell;
use libpulse_binding as pulse;
use pulse::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use pulse::mainloop::threaded::Mainloop;
use pulse::proplist::Proplist;
use pulse::sample::{Format, Spec};
use pulse::stream::{FlagSet as StreamFlagSet, PeekResult, State as StreamState, Stream};
use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const APP_NAME: &str = "vivavoce";

/// How long session start waits for a capture thread to report readiness.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for capture operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("pulseaudio error: {0}")]
    Backend(String),

    #[error("capture thread did not start in time")]
    StartTimeout,
}

/// Which producer strategy a session ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// PulseAudio threaded mainloop, samples delivered by read callback.
    Callback,
    /// Simple-API blocking reads on a dedicated thread.
    Polled,
}

/// Remote stop switch for a capture thread. Cloneable so teardown can keep
/// one after the receiving half has been handed to the frame pump.
#[derive(Debug, Clone)]
pub struct CaptureStopper(Arc<AtomicBool>);

impl CaptureStopper {
    /// Ask the capture thread to shut down. Idempotent.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Handle on one live capture session.
pub struct CaptureHandle {
    rx: mpsc::Receiver<AudioFrame>,
    shutdown: Arc<AtomicBool>,
    strategy: CaptureStrategy,
}

impl CaptureHandle {
    /// Next resampled frame; `None` once the capture thread has exited.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    pub fn strategy(&self) -> CaptureStrategy {
        self.strategy
    }

    pub fn stopper(&self) -> CaptureStopper {
        CaptureStopper(self.shutdown.clone())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Start capturing with the preferred strategy, falling back to polled
/// reads if the callback stream cannot be brought up.
pub fn start(cfg: &SessionConfig, gate: StateCell) -> Result<CaptureHandle, CaptureError> {
    match start_callback(cfg, gate.clone()) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            warn!("callback capture unavailable ({}), using polled reads", e);
            start_polled(cfg, gate)
        }
    }
}

fn capture_spec(cfg: &SessionConfig) -> Spec {
    Spec {
        format: Format::FLOAT32NE,
        channels: 1,
        rate: cfg.source_sample_rate,
    }
}

/// Native-rate bytes from PulseAudio to float samples. Pulse hands back
/// whole samples, but the slice may be misaligned, so copy rather than cast
/// in place.
fn bytes_to_samples(bytes: &[u8]) -> Vec<f32> {
    let usable = bytes.len() - bytes.len() % std::mem::size_of::<f32>();
    bytemuck::pod_collect_to_vec(&bytes[..usable])
}

/// Block until the setup thread reports success or failure.
fn await_ready(
    ready_rx: std::sync::mpsc::Receiver<Result<(), String>>,
) -> Result<(), CaptureError> {
    match ready_rx.recv_timeout(START_TIMEOUT) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(msg)) => Err(CaptureError::Backend(msg)),
        Err(_) => Err(CaptureError::StartTimeout),
    }
}

// ===== Callback strategy =====

pub fn start_callback(cfg: &SessionConfig, gate: StateCell) -> Result<CaptureHandle, CaptureError> {
    let (tx, rx) = mpsc::channel::<AudioFrame>(32);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    let cfg = cfg.clone();

    std::thread::Builder::new()
        .name("vivavoce-capture".to_string())
        .spawn(move || {
            if let Err(e) = run_callback_capture(&cfg, gate, tx, shutdown_thread, &ready_tx) {
                // Either reported through the handshake or logged here if the
                // stream died after startup.
                let _ = ready_tx.send(Err(e.clone()));
                error!("callback capture ended: {}", e);
            }
        })
        .map_err(|e| CaptureError::Backend(e.to_string()))?;

    await_ready(ready_rx)?;
    info!("capture started (callback strategy)");
    Ok(CaptureHandle {
        rx,
        shutdown,
        strategy: CaptureStrategy::Callback,
    })
}

fn run_callback_capture(
    cfg: &SessionConfig,
    gate: StateCell,
    tx: mpsc::Sender<AudioFrame>,
    shutdown: Arc<AtomicBool>,
    ready_tx: &std::sync::mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    let mainloop = Rc::new(RefCell::new(
        Mainloop::new().ok_or("failed to create mainloop")?,
    ));

    let mut proplist = Proplist::new().ok_or("failed to create proplist")?;
    proplist
        .set_str(pulse::proplist::properties::APPLICATION_NAME, APP_NAME)
        .map_err(|()| "failed to set application name")?;

    let context = Rc::new(RefCell::new(
        Context::new_with_proplist(mainloop.borrow().deref(), "vivavoce-capture", &proplist)
            .ok_or("failed to create context")?,
    ));

    // Signal the mainloop on every context state change so the setup code
    // below can wait for Ready.
    let ml_ref = mainloop.clone();
    let context_ref = context.clone();
    context
        .borrow_mut()
        .set_state_callback(Some(Box::new(move || {
            let state = unsafe { (*context_ref.as_ptr()).get_state() };
            match state {
                ContextState::Ready | ContextState::Failed | ContextState::Terminated => {
                    let ml = unsafe { &mut *ml_ref.as_ptr() };
                    ml.signal(false);
                }
                _ => {}
            }
        })));

    mainloop.borrow_mut().lock();
    context
        .borrow_mut()
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| format!("failed to connect context: {e}"))?;
    mainloop.borrow_mut().unlock();

    mainloop
        .borrow_mut()
        .start()
        .map_err(|e| format!("failed to start mainloop: {e}"))?;

    mainloop.borrow_mut().lock();
    loop {
        match context.borrow().get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                mainloop.borrow_mut().unlock();
                mainloop.borrow_mut().stop();
                return Err("context connection failed".to_string());
            }
            _ => mainloop.borrow_mut().wait(),
        }
    }
    mainloop.borrow_mut().unlock();

    let spec = capture_spec(cfg);
    let stream = Rc::new(RefCell::new(
        Stream::new(&mut context.borrow_mut(), "capture", &spec, None)
            .ok_or("failed to create stream")?,
    ));

    let resampler = Rc::new(RefCell::new(Resampler::new(cfg.source_sample_rate)));

    let tx_cb = tx.clone();
    let ml_ref = mainloop.clone();
    let stream_ref = stream.clone();
    let resampler_ref = resampler.clone();
    let shutdown_ref = shutdown.clone();

    stream
        .borrow_mut()
        .set_read_callback(Some(Box::new(move |length| {
            if length == 0 {
                return;
            }
            if shutdown_ref.load(Ordering::Relaxed) {
                unsafe {
                    (*ml_ref.as_ptr()).stop();
                }
                return;
            }

            let peek_result = unsafe { (*stream_ref.as_ptr()).peek() };
            match peek_result {
                Ok(PeekResult::Data(data)) => {
                    if !data.is_empty() {
                        let samples = bytes_to_samples(data);
                        let frame = unsafe { (*resampler_ref.as_ptr()).push(&samples) };
                        if let Some(frame) = frame {
                            // Read the state copy right before enqueueing so
                            // frames finished after cancellation are dropped.
                            if gate.is_listening() && tx_cb.blocking_send(frame).is_err() {
                                unsafe {
                                    (*ml_ref.as_ptr()).stop();
                                }
                                return;
                            }
                        }
                    }
                    unsafe {
                        let _ = (*stream_ref.as_ptr()).discard();
                    }
                }
                Ok(PeekResult::Empty) => {}
                Ok(PeekResult::Hole(_)) => unsafe {
                    let _ = (*stream_ref.as_ptr()).discard();
                },
                Err(e) => error!("failed to peek capture stream: {:?}", e),
            }
        })));

    let ml_ref = mainloop.clone();
    let stream_ref = stream.clone();
    stream
        .borrow_mut()
        .set_state_callback(Some(Box::new(move || {
            let state = unsafe { (*stream_ref.as_ptr()).get_state() };
            match state {
                StreamState::Ready | StreamState::Failed | StreamState::Terminated => unsafe {
                    (*ml_ref.as_ptr()).signal(false);
                },
                _ => {}
            }
        })));

    // ~20ms fragments at the native rate keep callback latency low.
    let bytes_per_sec = cfg.source_sample_rate * 4;
    let buffer_attr = pulse::def::BufferAttr {
        maxlength: bytes_per_sec,
        tlength: u32::MAX,
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: bytes_per_sec / 50,
    };

    mainloop.borrow_mut().lock();
    stream
        .borrow_mut()
        .connect_record(
            cfg.device.as_deref(),
            Some(&buffer_attr),
            StreamFlagSet::ADJUST_LATENCY | StreamFlagSet::AUTO_TIMING_UPDATE,
        )
        .map_err(|e| format!("failed to connect recording stream: {e}"))?;
    mainloop.borrow_mut().unlock();

    mainloop.borrow_mut().lock();
    loop {
        match stream.borrow().get_state() {
            StreamState::Ready => break,
            StreamState::Failed | StreamState::Terminated => {
                mainloop.borrow_mut().unlock();
                mainloop.borrow_mut().stop();
                return Err("stream connection failed".to_string());
            }
            _ => mainloop.borrow_mut().wait(),
        }
    }
    mainloop.borrow_mut().unlock();

    let _ = ready_tx.send(Ok(()));
    info!(
        "capture stream ready at {} Hz (callback)",
        cfg.source_sample_rate
    );

    // The threaded mainloop does the work; this thread only waits for the
    // stop switch.
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }

    mainloop.borrow_mut().lock();
    stream.borrow_mut().disconnect().ok();
    context.borrow_mut().disconnect();
    mainloop.borrow_mut().unlock();
    mainloop.borrow_mut().stop();

    Ok(())
}

// ===== Polled strategy =====

pub fn start_polled(cfg: &SessionConfig, gate: StateCell) -> Result<CaptureHandle, CaptureError> {
    let (tx, rx) = mpsc::channel::<AudioFrame>(32);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    let cfg = cfg.clone();

    std::thread::Builder::new()
        .name("vivavoce-capture-poll".to_string())
        .spawn(move || {
            run_polled_capture(&cfg, gate, tx, shutdown_thread, ready_tx);
        })
        .map_err(|e| CaptureError::Backend(e.to_string()))?;

    await_ready(ready_rx)?;
    info!("capture started (polled strategy)");
    Ok(CaptureHandle {
        rx,
        shutdown,
        strategy: CaptureStrategy::Polled,
    })
}

fn run_polled_capture(
    cfg: &SessionConfig,
    gate: StateCell,
    tx: mpsc::Sender<AudioFrame>,
    shutdown: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let spec = capture_spec(cfg);
    let simple = match libpulse_simple_binding::Simple::new(
        None,
        APP_NAME,
        pulse::stream::Direction::Record,
        cfg.device.as_deref(),
        "record",
        &spec,
        None,
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));
    info!(
        "capture stream ready at {} Hz (polled)",
        cfg.source_sample_rate
    );

    let mut resampler = Resampler::new(cfg.source_sample_rate);
    // 20ms of native-rate float samples per read.
    let chunk_bytes = (cfg.source_sample_rate as usize / 50) * 4;
    let mut buffer = vec![0u8; chunk_bytes];

    while !shutdown.load(Ordering::Relaxed) {
        match simple.read(&mut buffer) {
            Ok(()) => {
                let samples = bytes_to_samples(&buffer);
                if let Some(frame) = resampler.push(&samples) {
                    if gate.is_listening() && tx.blocking_send(frame).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                error!("capture read error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_convert_to_native_floats() {
        let floats = [0.0f32, 0.5, -1.0];
        let mut bytes: Vec<u8> = Vec::new();
        for f in floats {
            bytes.extend_from_slice(&f.to_ne_bytes());
        }
        assert_eq!(bytes_to_samples(&bytes), floats);
    }

    #[test]
    fn trailing_partial_sample_is_dropped() {
        let mut bytes = 1.0f32.to_ne_bytes().to_vec();
        bytes.push(0xAB);
        assert_eq!(bytes_to_samples(&bytes), vec![1.0]);
    }

    #[test]
    fn stopper_is_idempotent() {
        let flag = Arc::new(AtomicBool::new(false));
        let stopper = CaptureStopper(flag.clone());
        stopper.stop();
        stopper.stop();
        assert!(flag.load(Ordering::Relaxed));
    }
}
