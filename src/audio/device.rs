//! Seams between the pipeline and the audio hardware
//!
//! Devices run on their own threads and talk back through
//! [`SharedCaptureState`] (input) or a completion channel (output).

use super::capture::SharedCaptureState;
use super::wav::Clip;
use crate::error::{CaptureError, PlaybackError};
use tokio::sync::oneshot;

/// Reported by an output device when a clip stops on its own
pub type PlaybackDone = oneshot::Sender<Result<(), String>>;

/// A microphone that can be opened for one capture at a time
pub trait InputDevice: Send + Sync {
    /// Start streaming mono frames into `state`
    fn open(&self, state: SharedCaptureState) -> Result<Box<dyn InputStream>, CaptureError>;
}

/// A running microphone stream
pub trait InputStream: Send {
    /// Stop capture and release the device. Calling it again is a no-op.
    fn stop(&mut self);
}

/// A speaker that can render one clip at a time
pub trait OutputDevice: Send + Sync {
    /// Start rendering `clip`; `done` fires when it ends naturally or fails
    fn play(&self, clip: Clip, done: PlaybackDone) -> Result<Box<dyn OutputStream>, PlaybackError>;
}

/// A clip being rendered
pub trait OutputStream: Send {
    /// Halt rendering and release the device. Calling it again is a no-op.
    fn stop(&mut self);
}
