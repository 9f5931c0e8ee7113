//! JSON frames exchanged with the broadcast channel
//!
//! Every frame is `{"type": ..., "data": {...}}`. Audio travels base64
//! encoded; field names match the channel server.

use crate::models::{AudioPayload, InboundMessage, WAV_MIME};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MESSAGE_TYPE: &str = "broadcast";

/// Frames sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    AudioBroadcast(BroadcastRequest),
}

/// Outbound clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    /// Base64 encoded audio bytes
    pub audio_data: String,
    /// Seconds, as measured by the sender
    pub duration: f64,
}

impl BroadcastRequest {
    pub fn from_payload(payload: &AudioPayload) -> Self {
        Self {
            audio_data: BASE64.encode(&payload.encoded_bytes),
            duration: payload.duration_seconds,
        }
    }
}

/// Frames sent by the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    AudioMessage(AudioMessageFrame),
    Error(ErrorFrame),
}

/// A clip relayed from another participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMessageFrame {
    pub id: String,
    /// Sender's display id
    pub nft_token_id: i64,
    #[serde(default)]
    pub wallet_address: String,
    pub audio_data: String,
    pub duration: f64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

impl AudioMessageFrame {
    /// Decode the audio and build the message for the inbox
    pub fn into_inbound(self) -> Result<InboundMessage, base64::DecodeError> {
        let bytes = BASE64.decode(self.audio_data.as_bytes())?;
        Ok(InboundMessage {
            id: self.id,
            sender_display_id: self.nft_token_id,
            sender_address: self.wallet_address,
            kind: self.message_type,
            payload: AudioPayload::new(bytes, self.duration, WAV_MIME),
            received_at: self.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub detail: String,
}

fn default_message_type() -> String {
    DEFAULT_MESSAGE_TYPE.to_string()
}

/// RFC 3339 on the way out; RFC 3339 or a naive UTC `YYYY-MM-DD HH:MM:SS[.f]`
/// on the way in
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }
}
