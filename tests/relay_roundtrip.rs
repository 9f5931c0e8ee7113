//! End-to-end: clients talking through a local relay over loopback

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use yeti_talki::audio::{
    AudioArbiter, Clip, InputDevice, InputStream, OutputDevice, OutputStream, PlaybackDone,
    SharedCaptureState,
};
use yeti_talki::config::{CaptureConfig, RecordingConfig, RelayConfig, TransportConfig};
use yeti_talki::relay::{ChannelRelay, Identity, RelayHandle, StaticTokens};
use yeti_talki::{
    AudioPayload, CaptureError, ChannelTransport, ConnectionState, InboxSlot, PlaybackController,
    PlaybackError, PlaybackEvent, RecordingController, RecordingOutcome, TransportError,
    TransportEvent,
};

struct Idle;

impl InputStream for Idle {
    fn stop(&mut self) {}
}

impl OutputStream for Idle {
    fn stop(&mut self) {}
}

/// Delivers one second of a 440 Hz tone
struct ToneMicrophone;

impl InputDevice for ToneMicrophone {
    fn open(&self, state: SharedCaptureState) -> Result<Box<dyn InputStream>, CaptureError> {
        let tone: Vec<f32> = (0..16000)
            .map(|i| 0.4 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        state.process_samples(&tone, 16000);
        Ok(Box::new(Idle))
    }
}

/// Finishes every clip immediately
#[derive(Default)]
struct InstantSpeaker {
    clips: Mutex<Vec<Clip>>,
}

impl OutputDevice for InstantSpeaker {
    fn play(&self, clip: Clip, done: PlaybackDone) -> Result<Box<dyn OutputStream>, PlaybackError> {
        self.clips.lock().unwrap().push(clip);
        let _ = done.send(Ok(()));
        Ok(Box::new(Idle))
    }
}

async fn start_relay() -> (SocketAddr, RelayHandle) {
    let tokens = StaticTokens::new()
        .with("alice-token", Identity::new(101, "0xa11ce"))
        .with("bob-token", Identity::new(202, "0xb0b"))
        .with("carol-token", Identity::new(303, "0xca401"));
    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..RelayConfig::default()
    };
    let relay = ChannelRelay::bind(&config, Arc::new(tokens)).await.unwrap();
    let addr = relay.local_addr().unwrap();
    let handle = relay.handle();
    tokio::spawn(relay.run());
    (addr, handle)
}

async fn client(addr: SocketAddr, token: &str) -> ChannelTransport {
    let config = TransportConfig {
        server_url: format!("ws://{}/ws", addr),
        ..TransportConfig::default()
    };
    let transport = ChannelTransport::new(config, InboxSlot::new());
    transport.connect(token).await.unwrap();
    transport
}

async fn wait_online(handle: &RelayHandle, count: usize) {
    for _ in 0..200 {
        if handle.online_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("relay never reached {} participants", count);
}

async fn next_message(
    events: &mut tokio::sync::broadcast::Receiver<TransportEvent>,
) -> yeti_talki::InboundMessage {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a message")
            .unwrap();
        if let TransportEvent::Message(message) = event {
            return message;
        }
    }
}

#[tokio::test]
async fn test_broadcast_reaches_others_in_order() {
    let (addr, handle) = start_relay().await;
    let alice = client(addr, "alice-token").await;
    let bob = client(addr, "bob-token").await;
    let carol = client(addr, "carol-token").await;
    wait_online(&handle, 3).await;

    let mut bob_events = bob.subscribe();
    let mut carol_events = carol.subscribe();

    alice
        .send(AudioPayload::wav(b"first clip".to_vec(), 1.0))
        .await
        .unwrap();
    alice
        .send(AudioPayload::wav(b"second clip".to_vec(), 2.0))
        .await
        .unwrap();

    for events in [&mut bob_events, &mut carol_events] {
        let m1 = next_message(events).await;
        let m2 = next_message(events).await;
        assert_eq!(m1.payload.encoded_bytes, b"first clip");
        assert_eq!(m2.payload.encoded_bytes, b"second clip");
        assert_eq!(m2.payload.duration_seconds, 2.0);
        assert_eq!(m2.sender_display_id, 101);
        assert_eq!(m2.sender_address, "0xa11ce");
        assert_ne!(m1.id, m2.id);
    }

    // Newest wins, and the sender never hears itself
    assert_eq!(bob.inbox().peek().unwrap().payload.encoded_bytes, b"second clip");
    assert!(bob.inbox().has_unseen());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice.inbox().is_empty());
}

#[tokio::test]
async fn test_relay_rejects_overlong_message() {
    let (addr, handle) = start_relay().await;
    let alice = client(addr, "alice-token").await;
    let bob = client(addr, "bob-token").await;
    wait_online(&handle, 2).await;

    let mut alice_events = alice.subscribe();
    alice
        .send(AudioPayload::wav(vec![0; 16], 45.0))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), alice_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        TransportEvent::ServerError("Audio message too long (max 30 seconds)".to_string())
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob.inbox().is_empty());
}

#[tokio::test]
async fn test_bad_token_leaves_client_disconnected() {
    let (addr, _handle) = start_relay().await;
    let config = TransportConfig {
        server_url: format!("ws://{}/ws", addr),
        ..TransportConfig::default()
    };
    let transport = ChannelTransport::new(config, InboxSlot::new());

    let err = transport.connect("mallory-token").await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectFailed(_)));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_record_send_receive_play() {
    let (addr, handle) = start_relay().await;
    let alice = client(addr, "alice-token").await;
    let bob = client(addr, "bob-token").await;
    wait_online(&handle, 2).await;
    let mut bob_events = bob.subscribe();

    let recorder = RecordingController::new(
        RecordingConfig::default(),
        CaptureConfig::default(),
        Arc::new(ToneMicrophone),
        Arc::new(alice.clone()),
        AudioArbiter::new(),
    );
    recorder.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1050)).await;
    let outcome = recorder.stop().await.unwrap();
    let RecordingOutcome::Sent { duration_seconds } = outcome else {
        panic!("expected the clip to be sent, got {outcome:?}");
    };
    assert!(duration_seconds >= 0.3 && duration_seconds <= 30.0);

    let message = next_message(&mut bob_events).await;
    assert_eq!(message.sender_display_id, 101);
    assert_eq!(message.payload.duration_seconds, duration_seconds);

    let speaker = Arc::new(InstantSpeaker::default());
    let player = PlaybackController::new(bob.inbox().clone(), speaker.clone(), AudioArbiter::new());
    let mut player_events = player.subscribe();
    player.play().unwrap();
    assert!(!bob.inbox().has_unseen());

    let mut finished = false;
    while !finished {
        let event = tokio::time::timeout(Duration::from_secs(5), player_events.recv())
            .await
            .unwrap()
            .unwrap();
        finished = matches!(event, PlaybackEvent::Finished { .. });
    }

    let clips = speaker.clips.lock().unwrap();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].sample_rate, 16000);
    assert_eq!(clips[0].samples.len(), 16000);

    drop(clips);
    alice.disconnect().await;
    bob.disconnect().await;
    assert_eq!(alice.state(), ConnectionState::Disconnected);
}
