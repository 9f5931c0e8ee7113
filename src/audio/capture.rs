//! Microphone capture session
//!
//! A session owns the input stream, the sample buffer that becomes the
//! payload and the level meter. Closing it is the only way to get a payload
//! out, and dropping it without closing still stops the device.

use super::arbiter::AudioLease;
use super::device::{InputDevice, InputStream};
use super::level::LevelMeter;
use super::wav;
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::models::AudioPayload;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Current state of audio capture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Error,
}

/// Capture buffer shared with the device thread
#[derive(Clone)]
pub struct SharedCaptureState {
    inner: Arc<Mutex<CaptureStateInner>>,
}

struct CaptureStateInner {
    /// Captured samples (f32, mono)
    samples: Vec<f32>,
    /// Native rate reported by the device
    sample_rate: u32,
    state: CaptureState,
    error: Option<String>,
}

impl SharedCaptureState {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureStateInner {
                samples: Vec::new(),
                sample_rate,
                state: CaptureState::Idle,
                error: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureStateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CaptureState {
        self.lock().state
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    /// Seconds of audio captured so far
    pub fn duration(&self) -> f64 {
        let inner = self.lock();
        wav::duration_seconds(inner.samples.len(), inner.sample_rate)
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn set_state(&self, state: CaptureState) {
        self.lock().state = state;
    }

    /// Record a device failure; the session reports it on close
    pub fn set_error(&self, error: String) {
        let mut inner = self.lock();
        inner.error = Some(error);
        inner.state = CaptureState::Error;
    }

    /// Append a block of mono samples from the device
    pub fn process_samples(&self, samples: &[f32], sample_rate: u32) {
        let mut inner = self.lock();
        if sample_rate > 0 {
            inner.sample_rate = sample_rate;
        }
        inner.samples.extend_from_slice(samples);
    }

    /// Copy of the most recent `len` samples for the level meter
    pub fn recent_frame(&self, len: usize) -> Vec<f32> {
        let inner = self.lock();
        let start = inner.samples.len().saturating_sub(len);
        inner.samples[start..].to_vec()
    }

    fn take_samples(&self) -> (Vec<f32>, u32) {
        let mut inner = self.lock();
        (std::mem::take(&mut inner.samples), inner.sample_rate)
    }
}

/// One open microphone recording
pub struct AudioCaptureSession {
    state: SharedCaptureState,
    stream: Option<Box<dyn InputStream>>,
    meter: LevelMeter,
    _lease: Option<AudioLease>,
}

impl AudioCaptureSession {
    /// Acquire the microphone and start buffering audio
    pub fn open(device: &dyn InputDevice, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let state = SharedCaptureState::new(config.sample_rate);
        state.set_state(CaptureState::Capturing);

        let stream = device.open(state.clone()).inspect_err(|e| {
            warn!("Failed to open microphone: {}", e);
            state.set_state(CaptureState::Idle);
        })?;

        info!("Microphone capture started");
        Ok(Self {
            state,
            stream: Some(stream),
            meter: LevelMeter::new(config.fft_size),
            _lease: None,
        })
    }

    /// Keep `lease` alive until the session ends
    pub fn with_lease(mut self, lease: AudioLease) -> Self {
        self._lease = Some(lease);
        self
    }

    /// Normalized level (0.0 - 1.0) of the current audio frame
    pub fn sample(&mut self) -> f32 {
        let frame = self.state.recent_frame(self.meter.fft_size());
        self.meter.measure(&frame)
    }

    /// Seconds of audio the device has delivered
    pub fn captured_seconds(&self) -> f64 {
        self.state.duration()
    }

    /// Stop capture, release the microphone and package the recording
    ///
    /// `duration_seconds` is the caller's clock, carried in the payload.
    pub fn close(mut self, duration_seconds: f64) -> Result<AudioPayload, CaptureError> {
        self.release();

        if let Some(err) = self.state.error() {
            return Err(CaptureError::CaptureFailed(err));
        }

        let (samples, sample_rate) = self.state.take_samples();
        debug!(
            "Encoding {} samples at {} Hz ({:.1}s)",
            samples.len(),
            sample_rate,
            duration_seconds
        );
        let bytes = wav::encode(&samples, sample_rate).map_err(CaptureError::Encode)?;

        Ok(AudioPayload::wav(bytes, duration_seconds))
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            if self.state.state() == CaptureState::Capturing {
                self.state.set_state(CaptureState::Idle);
            }
            info!("Microphone capture stopped");
        }
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}
