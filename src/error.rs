//! Error types for each stage of the voice pipeline
//!
//! Every failure is local to one operation: the component that returned it
//! is back in its idle state and ready for a retry.

use thiserror::Error;

use crate::audio::AudioOwner;

/// Microphone capture failures
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Permission denied or no input device present
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device reported an error while the stream was running
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("failed to encode recording: {0}")]
    Encode(String),
}

/// Recording state machine failures
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no recording in progress")]
    NotRecording,

    /// Audio hardware is held by another operation
    #[error("audio device is busy ({0})")]
    DeviceBusy(AudioOwner),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Send(#[from] TransportError),
}

/// Channel connection and send failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to the channel")]
    NotConnected,

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("failed to send message: {0}")]
    SendFailed(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

/// Playback state machine failures
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no message to play")]
    NothingToPlay,

    #[error("playback already in progress")]
    AlreadyPlaying,

    #[error("nothing is playing")]
    NotPlaying,

    #[error("audio device is busy ({0})")]
    DeviceBusy(AudioOwner),

    /// Speaker inaccessible
    #[error("output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Malformed payload or device error mid-playback
    #[error("playback failed: {0}")]
    PlaybackFailed(String),
}

/// Configuration file failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Development relay failures
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener: {0}")]
    Bind(std::io::Error),

    #[error("failed to load token table: {0}")]
    Tokens(String),
}
