//! Push-to-talk recording state machine
//!
//! Idle -> Recording -> Finalizing -> Idle. While recording, a tick task
//! advances the elapsed time in fixed steps and samples the level meter.
//! Reaching the ceiling stops the recording through the same path as a
//! manual stop.

use crate::audio::{AudioArbiter, AudioCaptureSession, AudioOwner, InputDevice};
use crate::config::{CaptureConfig, RecordingConfig};
use crate::error::{CaptureError, RecordingError};
use crate::models::{RecordingProgress, RecordingState};
use crate::transport::Broadcaster;
use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    /// Maximum duration reached
    Cutoff,
}

/// What happened to a finished recording
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordingOutcome {
    Sent { duration_seconds: f64 },
    /// Shorter than the minimum; nothing was sent
    Discarded { duration_seconds: f64 },
    Cancelled,
}

/// Lifecycle notifications, including stops the caller did not ask for
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    Started,
    Finished {
        reason: StopReason,
        outcome: RecordingOutcome,
    },
    Failed {
        reason: StopReason,
        error: String,
    },
}

struct ActiveRecording {
    session: AudioCaptureSession,
    ticker: JoinHandle<()>,
    ticks: u32,
}

#[derive(Default)]
struct RecorderInner {
    state: RecordingState,
    active: Option<ActiveRecording>,
    generation: u64,
    /// Microphone open in flight; the state is still Idle
    opening: bool,
}

/// Clears the opening flag however `start` ends
struct OpeningGuard<'a> {
    shared: &'a Shared,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().opening = false;
    }
}

/// Puts the controller back to Idle if finalizing is abandoned midway
struct FinalizeGuard<'a> {
    shared: &'a Shared,
    reason: StopReason,
    armed: bool,
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Recording abandoned before it was sent");
        {
            let mut inner = self.shared.lock();
            self.shared.set_state(&mut inner, RecordingState::Idle);
        }
        let _ = self.shared.events.send(RecordingEvent::Failed {
            reason: self.reason,
            error: "stop abandoned before the recording was sent".to_string(),
        });
    }
}

struct Shared {
    config: RecordingConfig,
    capture: CaptureConfig,
    input: Arc<dyn InputDevice>,
    broadcaster: Arc<dyn Broadcaster>,
    arbiter: AudioArbiter,
    inner: Mutex<RecorderInner>,
    state: watch::Sender<RecordingState>,
    progress: watch::Sender<RecordingProgress>,
    events: broadcast::Sender<RecordingEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RecorderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut RecorderInner, state: RecordingState) {
        inner.state = state;
        self.state.send_replace(state);
    }

    /// Advance one tick; returns true when the ceiling has been reached
    fn tick(&self, generation: u64) -> Option<bool> {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != RecordingState::Recording {
            return None;
        }
        let active = inner.active.as_mut()?;
        active.ticks += 1;
        let level = active.session.sample();
        let ticks = active.ticks;

        self.progress.send_replace(RecordingProgress {
            elapsed_seconds: self.config.elapsed_secs(ticks),
            level,
        });
        Some(ticks >= self.config.max_ticks())
    }

    /// Shared stop path for manual stops and the cutoff
    async fn finish(
        &self,
        reason: StopReason,
        generation: Option<u64>,
    ) -> Result<RecordingOutcome, RecordingError> {
        let (active, elapsed) = {
            let mut inner = self.lock();
            if inner.state != RecordingState::Recording
                || generation.is_some_and(|g| g != inner.generation)
            {
                return Err(RecordingError::NotRecording);
            }
            let Some(active) = inner.active.take() else {
                self.set_state(&mut inner, RecordingState::Idle);
                return Err(RecordingError::NotRecording);
            };
            self.set_state(&mut inner, RecordingState::Finalizing);
            let elapsed = self.config.elapsed_secs(active.ticks);
            (active, elapsed)
        };

        // On cutoff the ticker is the caller and exits on its own
        if reason == StopReason::Manual {
            active.ticker.abort();
        }

        let mut guard = FinalizeGuard {
            shared: self,
            reason,
            armed: true,
        };
        let result = self.finalize(active.session, elapsed).await;
        guard.armed = false;

        {
            let mut inner = self.lock();
            self.set_state(&mut inner, RecordingState::Idle);
        }

        let event = match &result {
            Ok(outcome) => RecordingEvent::Finished {
                reason,
                outcome: *outcome,
            },
            Err(e) => {
                warn!("Recording failed: {}", e);
                RecordingEvent::Failed {
                    reason,
                    error: e.to_string(),
                }
            }
        };
        let _ = self.events.send(event);
        result
    }

    async fn finalize(
        &self,
        session: AudioCaptureSession,
        elapsed: f64,
    ) -> Result<RecordingOutcome, RecordingError> {
        // Stopping a device stream joins its thread
        let payload = tokio::task::spawn_blocking(move || session.close(elapsed))
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))??;

        if elapsed < self.config.min_duration_secs {
            info!("Discarding {:.1}s recording (below minimum)", elapsed);
            return Ok(RecordingOutcome::Discarded {
                duration_seconds: elapsed,
            });
        }

        self.broadcaster.broadcast(payload).await?;
        Ok(RecordingOutcome::Sent {
            duration_seconds: elapsed,
        })
    }
}

async fn tick_loop(shared: Arc<Shared>, generation: u64) {
    let mut interval = tokio::time::interval(shared.config.tick_interval());
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        match shared.tick(generation) {
            Some(false) => {}
            Some(true) => {
                info!("Maximum recording duration reached");
                let _ = shared.finish(StopReason::Cutoff, Some(generation)).await;
                break;
            }
            None => break,
        }
    }
}

/// Drives one client's recordings; cheap to clone
#[derive(Clone)]
pub struct RecordingController {
    shared: Arc<Shared>,
}

impl RecordingController {
    pub fn new(
        config: RecordingConfig,
        capture: CaptureConfig,
        input: Arc<dyn InputDevice>,
        broadcaster: Arc<dyn Broadcaster>,
        arbiter: AudioArbiter,
    ) -> Self {
        let (state, _) = watch::channel(RecordingState::Idle);
        let (progress, _) = watch::channel(RecordingProgress::default());
        let (events, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                config,
                capture,
                input,
                broadcaster,
                arbiter,
                inner: Mutex::new(RecorderInner::default()),
                state,
                progress,
                events,
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.shared.lock().state
    }

    pub fn progress(&self) -> RecordingProgress {
        *self.shared.progress.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RecordingState> {
        self.shared.state.subscribe()
    }

    /// Elapsed time and level, updated on every tick
    pub fn subscribe_progress(&self) -> watch::Receiver<RecordingProgress> {
        self.shared.progress.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.shared.events.subscribe()
    }

    /// Open the microphone and start the tick
    ///
    /// The device is opened on the blocking pool; the state turns Recording
    /// only once it is open.
    ///
    /// # Panics
    ///
    /// Must be polled within a Tokio runtime.
    pub async fn start(&self) -> Result<(), RecordingError> {
        let shared = &self.shared;
        let lease = {
            let mut inner = shared.lock();
            if inner.state != RecordingState::Idle || inner.opening {
                return Err(RecordingError::AlreadyRecording);
            }
            let lease = shared
                .arbiter
                .acquire(AudioOwner::Recording)
                .map_err(RecordingError::DeviceBusy)?;
            inner.opening = true;
            lease
        };
        let _opening = OpeningGuard {
            shared: shared.as_ref(),
        };

        let input = shared.input.clone();
        let capture = shared.capture.clone();
        let session = tokio::task::spawn_blocking(move || {
            AudioCaptureSession::open(input.as_ref(), &capture).map(|s| s.with_lease(lease))
        })
        .await
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))??;

        let mut inner = shared.lock();
        inner.opening = false;
        inner.generation += 1;
        let generation = inner.generation;
        let ticker = tokio::spawn(tick_loop(shared.clone(), generation));

        inner.active = Some(ActiveRecording {
            session,
            ticker,
            ticks: 0,
        });
        shared.set_state(&mut inner, RecordingState::Recording);
        shared.progress.send_replace(RecordingProgress::default());
        drop(inner);

        info!("Recording started");
        let _ = shared.events.send(RecordingEvent::Started);
        Ok(())
    }

    /// Stop, package and send the recording
    pub async fn stop(&self) -> Result<RecordingOutcome, RecordingError> {
        self.shared.finish(StopReason::Manual, None).await
    }

    /// Abandon the recording without sending anything
    pub fn cancel(&self) -> Result<(), RecordingError> {
        let active = {
            let mut inner = self.shared.lock();
            if inner.state != RecordingState::Recording {
                return Err(RecordingError::NotRecording);
            }
            let active = inner.active.take();
            self.shared.set_state(&mut inner, RecordingState::Idle);
            active
        };

        if let Some(active) = active {
            active.ticker.abort();
            drop(active.session);
        }
        info!("Recording cancelled");
        let _ = self.shared.events.send(RecordingEvent::Finished {
            reason: StopReason::Manual,
            outcome: RecordingOutcome::Cancelled,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakeMicrophone;
    use crate::error::TransportError;
    use crate::models::AudioPayload;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeChannel {
        sent: Mutex<Vec<AudioPayload>>,
        offline: bool,
        /// Never completes a broadcast
        stalled: bool,
    }

    impl FakeChannel {
        fn sent(&self) -> Vec<AudioPayload> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broadcaster for FakeChannel {
        async fn broadcast(&self, payload: AudioPayload) -> Result<(), TransportError> {
            if self.offline {
                return Err(TransportError::NotConnected);
            }
            if self.stalled {
                std::future::pending::<()>().await;
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct Rig {
        controller: RecordingController,
        mic: Arc<FakeMicrophone>,
        channel: Arc<FakeChannel>,
        arbiter: AudioArbiter,
    }

    fn rig_with(mic: FakeMicrophone, channel: FakeChannel) -> Rig {
        rig_configured(RecordingConfig::default(), mic, channel)
    }

    fn rig_configured(config: RecordingConfig, mic: FakeMicrophone, channel: FakeChannel) -> Rig {
        let mic = Arc::new(mic);
        let channel = Arc::new(channel);
        let arbiter = AudioArbiter::new();
        let controller = RecordingController::new(
            config,
            CaptureConfig::default(),
            mic.clone(),
            channel.clone(),
            arbiter.clone(),
        );
        Rig {
            controller,
            mic,
            channel,
            arbiter,
        }
    }

    fn rig() -> Rig {
        rig_with(FakeMicrophone::with_tone(1.0), FakeChannel::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let rig = rig();
        rig.controller.start().await.unwrap();
        assert!(matches!(
            rig.controller.start().await,
            Err(RecordingError::AlreadyRecording)
        ));
        assert_eq!(rig.controller.state(), RecordingState::Recording);
        assert_eq!(rig.mic.usage.opened(), 1);
        rig.controller.cancel().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_short_recording_is_discarded() {
        let rig = rig();
        rig.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = rig.controller.stop().await.unwrap();
        assert!(matches!(outcome, RecordingOutcome::Discarded { .. }));
        assert!(rig.channel.sent().is_empty());
        assert_eq!(rig.controller.state(), RecordingState::Idle);
        assert_eq!(rig.mic.usage.held(), 0);
        assert_eq!(rig.arbiter.holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_sends_payload() {
        let rig = rig();
        let mut progress = rig.controller.subscribe_progress();
        rig.controller.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2050)).await;
        assert!(progress.has_changed().unwrap());
        let latest = *progress.borrow_and_update();
        assert_eq!(latest.elapsed_seconds, 2.0);
        assert!(latest.level > 0.0 && latest.level <= 1.0);

        let outcome = rig.controller.stop().await.unwrap();
        assert_eq!(
            outcome,
            RecordingOutcome::Sent {
                duration_seconds: 2.0
            }
        );

        let sent = rig.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].duration_seconds, 2.0);
        assert_eq!(sent[0].mime_kind, "audio/wav");
        assert_eq!(rig.controller.state(), RecordingState::Idle);
        assert_eq!(rig.mic.usage.held(), 0);

        // The tick is gone: time passing changes nothing
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!progress.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cutoff_stops_at_ceiling() {
        let rig = rig();
        let mut events = rig.controller.subscribe();
        let mut progress = rig.controller.subscribe_progress();
        rig.controller.start().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), RecordingEvent::Started);

        let mut max_seen: f64 = 0.0;
        let finished = loop {
            tokio::select! {
                event = events.recv() => break event.unwrap(),
                changed = progress.changed() => {
                    changed.unwrap();
                    max_seen = max_seen.max(progress.borrow_and_update().elapsed_seconds);
                }
            }
        };

        assert_eq!(
            finished,
            RecordingEvent::Finished {
                reason: StopReason::Cutoff,
                outcome: RecordingOutcome::Sent {
                    duration_seconds: 30.0
                },
            }
        );
        assert!(max_seen <= 30.0);
        assert_eq!(rig.controller.progress().elapsed_seconds, 30.0);
        assert_eq!(rig.controller.state(), RecordingState::Idle);

        let sent = rig.channel.sent();
        assert_eq!(sent.len(), 1);
        assert!((sent[0].duration_seconds - 30.0).abs() < 1e-9);
        assert_eq!(rig.mic.usage.held(), 0);

        // A late manual stop finds nothing to stop
        assert!(matches!(
            rig.controller.stop().await,
            Err(RecordingError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_denied_microphone_leaves_controller_idle() {
        let rig = rig_with(FakeMicrophone::denied(), FakeChannel::default());
        let err = rig.controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            RecordingError::Capture(CaptureError::DeviceUnavailable(_))
        ));
        assert_eq!(rig.controller.state(), RecordingState::Idle);
        assert_eq!(rig.arbiter.holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_returns_to_idle() {
        let rig = rig_with(
            FakeMicrophone::with_tone(1.0),
            FakeChannel {
                offline: true,
                ..FakeChannel::default()
            },
        );
        let mut events = rig.controller.subscribe();
        rig.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1050)).await;

        let err = rig.controller.stop().await.unwrap_err();
        assert!(matches!(
            err,
            RecordingError::Send(TransportError::NotConnected)
        ));
        assert_eq!(rig.controller.state(), RecordingState::Idle);
        assert_eq!(rig.mic.usage.held(), 0);

        assert_eq!(events.recv().await.unwrap(), RecordingEvent::Started);
        assert!(matches!(
            events.recv().await.unwrap(),
            RecordingEvent::Failed {
                reason: StopReason::Manual,
                ..
            }
        ));

        // Ready for another attempt
        rig.controller.start().await.unwrap();
        rig.controller.cancel().unwrap();
    }

    #[tokio::test]
    async fn test_busy_audio_hardware_blocks_start() {
        let rig = rig();
        let _playing = rig.arbiter.acquire(AudioOwner::Playback).unwrap();
        assert!(matches!(
            rig.controller.start().await,
            Err(RecordingError::DeviceBusy(AudioOwner::Playback))
        ));
        assert_eq!(rig.mic.usage.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_sends_nothing() {
        let rig = rig();
        rig.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        rig.controller.cancel().unwrap();
        assert_eq!(rig.controller.state(), RecordingState::Idle);
        assert_eq!(rig.mic.usage.held(), 0);
        assert_eq!(rig.arbiter.holder(), None);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rig.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let rig = rig();
        assert!(matches!(
            rig.controller.stop().await,
            Err(RecordingError::NotRecording)
        ));
        assert!(matches!(
            rig.controller.cancel(),
            Err(RecordingError::NotRecording)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cutoff_respects_uneven_ceiling() {
        let config = RecordingConfig {
            max_duration_secs: 30.05,
            ..RecordingConfig::default()
        };
        let rig = rig_configured(config, FakeMicrophone::with_tone(1.0), FakeChannel::default());
        let mut events = rig.controller.subscribe();
        let mut progress = rig.controller.subscribe_progress();
        rig.controller.start().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), RecordingEvent::Started);

        let mut max_seen: f64 = 0.0;
        let finished = loop {
            tokio::select! {
                event = events.recv() => break event.unwrap(),
                changed = progress.changed() => {
                    changed.unwrap();
                    max_seen = max_seen.max(progress.borrow_and_update().elapsed_seconds);
                }
            }
        };

        assert_eq!(
            finished,
            RecordingEvent::Finished {
                reason: StopReason::Cutoff,
                outcome: RecordingOutcome::Sent {
                    duration_seconds: 30.0
                },
            }
        );
        assert!(max_seen <= 30.05);
        assert_eq!(rig.channel.sent()[0].duration_seconds, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_stop_returns_to_idle() {
        let rig = rig_with(
            FakeMicrophone::with_tone(1.0),
            FakeChannel {
                stalled: true,
                ..FakeChannel::default()
            },
        );
        let mut events = rig.controller.subscribe();
        rig.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1050)).await;

        let stop = tokio::time::timeout(Duration::from_secs(5), rig.controller.stop()).await;
        assert!(stop.is_err());
        assert_eq!(rig.controller.state(), RecordingState::Idle);
        assert_eq!(rig.mic.usage.held(), 0);
        assert_eq!(rig.arbiter.holder(), None);

        assert_eq!(events.recv().await.unwrap(), RecordingEvent::Started);
        assert!(matches!(
            events.recv().await.unwrap(),
            RecordingEvent::Failed {
                reason: StopReason::Manual,
                ..
            }
        ));

        rig.controller.start().await.unwrap();
        assert_eq!(rig.controller.state(), RecordingState::Recording);
        rig.controller.cancel().unwrap();
    }

    #[tokio::test]
    async fn test_slow_microphone_does_not_block_runtime() {
        let mic = FakeMicrophone {
            open_delay: Duration::from_millis(300),
            ..FakeMicrophone::with_tone(1.0)
        };
        let rig = rig_with(mic, FakeChannel::default());

        let controller = rig.controller.clone();
        let opening = tokio::spawn(async move { controller.start().await });

        // Other work keeps running while the device opens
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rig.controller.state(), RecordingState::Idle);
        assert!(matches!(
            rig.controller.start().await,
            Err(RecordingError::AlreadyRecording)
        ));

        opening.await.unwrap().unwrap();
        assert_eq!(rig.controller.state(), RecordingState::Recording);
        assert_eq!(rig.mic.usage.opened(), 1);
        rig.controller.cancel().unwrap();
        assert_eq!(rig.arbiter.holder(), None);
    }
}
