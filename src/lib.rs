//! Yeti Talki - push-to-talk voice messages over a shared broadcast channel
//!
//! A client records a short clip with [`RecordingController`], which hands
//! the finished payload to a [`Broadcaster`] such as [`ChannelTransport`].
//! The channel relays it to every other participant, whose transport drops
//! it into their [`InboxSlot`]; [`PlaybackController`] plays it on demand.
//!
//! Audio devices sit behind the traits in [`audio`]. PipeWire
//! implementations are available with the `pipewire` feature.

pub mod audio;
pub mod config;
pub mod error;
pub mod inbox;
pub mod models;
pub mod playback;
pub mod recording;
pub mod relay;
pub mod transport;

pub use audio::{AudioArbiter, AudioCaptureSession, InputDevice, OutputDevice};
pub use config::TalkiConfig;
pub use error::{CaptureError, ConfigError, PlaybackError, RecordingError, RelayError, TransportError};
pub use inbox::InboxSlot;
pub use models::{
    AudioPayload, ConnectionState, InboundMessage, Participant, PlaybackState, RecordingProgress,
    RecordingState,
};
pub use playback::{PlaybackController, PlaybackEvent};
pub use recording::{RecordingController, RecordingEvent, RecordingOutcome, StopReason};
pub use relay::ChannelRelay;
pub use transport::{Broadcaster, ChannelTransport, TransportEvent};
