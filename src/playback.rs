//! Playback of the inbox message
//!
//! Idle -> Playing -> Idle. A clip ends when the device reports it done,
//! when it fails or when the user stops it. Every exit runs through the
//! same teardown, which releases the output device and the audio lease.

use crate::audio::{wav, AudioArbiter, AudioLease, AudioOwner, OutputDevice, OutputStream};
use crate::error::PlaybackError;
use crate::inbox::InboxSlot;
use crate::models::PlaybackState;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};

/// Lifecycle notifications keyed by message id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { message_id: String },
    /// The clip played to its end
    Finished { message_id: String },
    Stopped { message_id: String },
    Failed { message_id: String, error: String },
}

struct ActivePlayback {
    stream: Box<dyn OutputStream>,
    _lease: AudioLease,
    generation: u64,
    message_id: String,
}

impl ActivePlayback {
    fn teardown(mut self) -> String {
        self.stream.stop();
        self.message_id
    }
}

#[derive(Default)]
struct PlayerInner {
    active: Option<ActivePlayback>,
    generation: u64,
}

struct Shared {
    inbox: InboxSlot,
    output: Arc<dyn OutputDevice>,
    arbiter: AudioArbiter,
    inner: Mutex<PlayerInner>,
    state: watch::Sender<PlaybackState>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear down the clip started as `generation`, if it is still current
    fn complete(&self, generation: u64, result: Result<(), String>) {
        let message_id = {
            let mut inner = self.lock();
            match &inner.active {
                Some(active) if active.generation == generation => {}
                _ => {
                    debug!("Ignoring completion of stale playback {}", generation);
                    return;
                }
            }
            let Some(active) = inner.active.take() else {
                return;
            };
            let message_id = active.teardown();
            self.state.send_replace(PlaybackState::Idle);
            message_id
        };

        let event = match result {
            Ok(()) => {
                info!("Playback of {} finished", message_id);
                PlaybackEvent::Finished { message_id }
            }
            Err(error) => {
                warn!("Playback of {} failed: {}", message_id, error);
                PlaybackEvent::Failed { message_id, error }
            }
        };
        let _ = self.events.send(event);
    }
}

async fn watch_completion(
    shared: Arc<Shared>,
    generation: u64,
    done: oneshot::Receiver<Result<(), String>>,
) {
    let result = done
        .await
        .unwrap_or_else(|_| Err("output stream ended unexpectedly".to_string()));
    shared.complete(generation, result);
}

/// Plays the inbox message on the output device; cheap to clone
#[derive(Clone)]
pub struct PlaybackController {
    shared: Arc<Shared>,
}

impl PlaybackController {
    pub fn new(inbox: InboxSlot, output: Arc<dyn OutputDevice>, arbiter: AudioArbiter) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        let (events, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                inbox,
                output,
                arbiter,
                inner: Mutex::new(PlayerInner::default()),
                state,
                events,
            }),
        }
    }

    pub fn state(&self) -> PlaybackState {
        if self.shared.lock().active.is_some() {
            PlaybackState::Playing
        } else {
            PlaybackState::Idle
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }

    /// Start rendering the inbox message and mark it seen
    ///
    /// The completion watcher runs on the current Tokio runtime; without one
    /// this fails before touching the inbox or the device.
    pub fn play(&self) -> Result<(), PlaybackError> {
        let runtime = Handle::try_current()
            .map_err(|e| PlaybackError::PlaybackFailed(format!("no async runtime: {}", e)))?;
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.active.is_some() {
            return Err(PlaybackError::AlreadyPlaying);
        }

        let message = shared.inbox.consume().ok_or(PlaybackError::NothingToPlay)?;
        let lease = shared
            .arbiter
            .acquire(AudioOwner::Playback)
            .map_err(PlaybackError::DeviceBusy)?;

        let clip = wav::decode(&message.payload.encoded_bytes).map_err(|e| {
            warn!("Message {} is not playable: {}", message.id, e);
            PlaybackError::PlaybackFailed(e)
        })?;
        debug!(
            "Playing {} ({:.1}s at {} Hz)",
            message.id,
            clip.duration_seconds(),
            clip.sample_rate
        );

        let (done_tx, done_rx) = oneshot::channel();
        let stream = shared.output.play(clip, done_tx)?;

        inner.generation += 1;
        let generation = inner.generation;
        inner.active = Some(ActivePlayback {
            stream,
            _lease: lease,
            generation,
            message_id: message.id.clone(),
        });
        shared.state.send_replace(PlaybackState::Playing);
        drop(inner);

        shared.inbox.mark_seen();
        info!("Playback of {} started", message.id);
        let _ = shared.events.send(PlaybackEvent::Started {
            message_id: message.id.clone(),
        });

        runtime.spawn(watch_completion(shared.clone(), generation, done_rx));
        Ok(())
    }

    /// Halt the current clip
    pub fn stop(&self) -> Result<(), PlaybackError> {
        let message_id = {
            let mut inner = self.shared.lock();
            let active = inner.active.take().ok_or(PlaybackError::NotPlaying)?;
            let message_id = active.teardown();
            self.shared.state.send_replace(PlaybackState::Idle);
            message_id
        };

        info!("Playback of {} stopped", message_id);
        let _ = self.shared.events.send(PlaybackEvent::Stopped { message_id });
        Ok(())
    }
}
