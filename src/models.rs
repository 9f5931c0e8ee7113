use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MIME kind for payloads produced by the capture session
pub const WAV_MIME: &str = "audio/wav";

/// An authenticated member of the channel
///
/// Issued by the identity collaborator after eligibility checks; the core
/// never validates the token itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub identity_token: String,
    pub display_id: i64,
}

impl Participant {
    pub fn new(identity_token: impl Into<String>, display_id: i64) -> Self {
        Self {
            identity_token: identity_token.into(),
            display_id,
        }
    }
}

/// One finished voice clip, opaque to everything but the codec
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub encoded_bytes: Vec<u8>,
    pub duration_seconds: f64,
    pub mime_kind: String,
}

impl AudioPayload {
    pub fn new(encoded_bytes: Vec<u8>, duration_seconds: f64, mime_kind: impl Into<String>) -> Self {
        Self {
            encoded_bytes,
            duration_seconds,
            mime_kind: mime_kind.into(),
        }
    }

    pub fn wav(encoded_bytes: Vec<u8>, duration_seconds: f64) -> Self {
        Self::new(encoded_bytes, duration_seconds, WAV_MIME)
    }

    pub fn len(&self) -> usize {
        self.encoded_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_bytes.is_empty()
    }
}

/// A clip relayed to this client by the channel
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub sender_display_id: i64,
    pub sender_address: String,
    pub kind: String,
    pub payload: AudioPayload,
    pub received_at: DateTime<Utc>,
}

/// Connectivity of the channel transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Recording state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Finalizing,
}

/// Playback state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
}

/// Live feedback published on every recording tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RecordingProgress {
    /// Seconds since recording started, in whole tick steps
    pub elapsed_seconds: f64,
    /// Normalized microphone level (0.0 - 1.0)
    pub level: f32,
}
