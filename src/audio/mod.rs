//! Audio capture, level metering, WAV packaging and device access
//!
//! This module provides:
//! - Microphone capture sessions with a frequency-domain level meter
//! - In-memory WAV payloads via hound
//! - Exclusive access to the audio hardware for recording or playback
//! - PipeWire devices (feature `pipewire`)

mod arbiter;
mod capture;
mod device;
mod level;
#[cfg(feature = "pipewire")]
mod pipewire;
pub mod wav;

pub use arbiter::{AudioArbiter, AudioLease, AudioOwner};
pub use capture::{AudioCaptureSession, CaptureState, SharedCaptureState};
pub use device::{InputDevice, InputStream, OutputDevice, OutputStream, PlaybackDone};
pub use level::LevelMeter;
#[cfg(feature = "pipewire")]
pub use self::pipewire::{PipeWireMicrophone, PipeWireSpeaker};
pub use wav::Clip;

#[cfg(test)]
pub(crate) use device::fake;
