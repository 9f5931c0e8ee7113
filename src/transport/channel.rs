//! WebSocket connection to the broadcast channel
//!
//! One reader task delivers inbound clips into the inbox; one writer task
//! owns the socket's send half and acknowledges each outbound frame. The
//! transport never reconnects on its own.

use super::wire::{BroadcastRequest, ClientFrame, ServerFrame};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::inbox::InboxSlot;
use crate::models::{AudioPayload, ConnectionState, InboundMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time allowed for the writer to flush a close frame on disconnect
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Something that can put a finished clip on the channel
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, payload: AudioPayload) -> Result<(), TransportError>;
}

/// Inbound notifications from the channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A clip from another participant, already deposited in the inbox
    Message(InboundMessage),
    /// The server rejected something we sent
    ServerError(String),
}

struct Outbound {
    frame: WsMessage,
    ack: oneshot::Sender<Result<(), String>>,
}

struct Session {
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Shared {
    config: TransportConfig,
    inbox: InboxSlot,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    /// Bumped by every connect attempt
    attempt: AtomicU64,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_text(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring unrecognized channel frame: {}", e);
                return;
            }
        };

        match frame {
            ServerFrame::AudioMessage(frame) => {
                let id = frame.id.clone();
                match frame.into_inbound() {
                    Ok(message) => {
                        info!(
                            "Received message {} from #{} ({:.1}s)",
                            message.id, message.sender_display_id, message.payload.duration_seconds
                        );
                        self.inbox.deposit(message.clone());
                        let _ = self.events.send(TransportEvent::Message(message));
                    }
                    Err(e) => warn!("Dropping message {} with undecodable audio: {}", id, e),
                }
            }
            ServerFrame::Error(err) => {
                warn!("Channel reported an error: {}", err.detail);
                let _ = self.events.send(TransportEvent::ServerError(err.detail));
            }
        }
    }

    /// Reader saw the socket end; tear down if it still belongs to us
    fn connection_lost(&self, generation: u64) {
        let mut session = self.lock_session();
        if session.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        if let Some(lost) = session.take() {
            lost.writer.abort();
        }
        self.state.send_replace(ConnectionState::Disconnected);
        warn!("Connection to channel lost");
    }
}

/// Falls back to Disconnected if a connect attempt is dropped mid-handshake
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    attempt: u64,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let session = self.shared.lock_session();
        if session.is_none()
            && self.shared.attempt.load(Ordering::SeqCst) == self.attempt
            && *self.shared.state.borrow() == ConnectionState::Connecting
        {
            debug!("Connect attempt abandoned during handshake");
            self.shared.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

/// Client side of the broadcast channel; cheap to clone
#[derive(Clone)]
pub struct ChannelTransport {
    shared: Arc<Shared>,
}

impl ChannelTransport {
    /// Inbound clips are deposited into `inbox`
    pub fn new(config: TransportConfig, inbox: InboxSlot) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                inbox,
                state,
                events,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempt: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    pub fn inbox(&self) -> &InboxSlot {
        &self.shared.inbox
    }

    /// Open the channel connection for the participant holding `identity_token`
    pub async fn connect(&self, identity_token: &str) -> Result<(), TransportError> {
        let attempt = {
            let session = self.shared.lock_session();
            if session.is_some() || self.state() != ConnectionState::Disconnected {
                return Err(TransportError::AlreadyConnected);
            }
            self.shared.state.send_replace(ConnectionState::Connecting);
            self.shared.attempt.fetch_add(1, Ordering::SeqCst) + 1
        };
        let _connecting = ConnectingGuard {
            shared: self.shared.as_ref(),
            attempt,
        };

        let ws = match self.handshake(identity_token).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Failed to connect to channel: {}", e);
                self.shared.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let cancelled = {
            let mut session = self.shared.lock_session();
            if self.state() != ConnectionState::Connecting
                || self.shared.attempt.load(Ordering::SeqCst) != attempt
            {
                // disconnect() ran while the handshake was in flight
                Some(ws)
            } else {
                let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let (write, read) = ws.split();
                let (outbound, outbound_rx) = mpsc::channel(8);

                let writer = tokio::spawn(write_loop(write, outbound_rx));
                let reader = tokio::spawn(read_loop(read, self.shared.clone(), generation));

                *session = Some(Session {
                    generation,
                    outbound,
                    reader,
                    writer,
                });
                self.shared.state.send_replace(ConnectionState::Connected);
                None
            }
        };

        if let Some(mut ws) = cancelled {
            let _ = ws.close(None).await;
            return Err(TransportError::ConnectFailed(
                "connection cancelled".to_string(),
            ));
        }

        info!("Connected to channel at {}", self.shared.config.server_url);
        Ok(())
    }

    async fn handshake(&self, identity_token: &str) -> Result<WsStream, TransportError> {
        let request = build_request(&self.shared.config.server_url, identity_token)?;

        match tokio::time::timeout(
            self.shared.config.connect_timeout(),
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(TransportError::ConnectFailed(e.to_string())),
            Err(_elapsed) => Err(TransportError::ConnectFailed(format!(
                "timed out after {}s",
                self.shared.config.connect_timeout_secs
            ))),
        }
    }

    /// Close the connection; a later `connect` starts from scratch
    pub async fn disconnect(&self) {
        let session = self.shared.lock_session().take();
        self.shared.state.send_replace(ConnectionState::Disconnected);

        let Some(session) = session else {
            return;
        };

        session.reader.abort();
        // Dropping the sender lets the writer send a close frame and exit
        drop(session.outbound);
        let mut writer = session.writer;
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        info!("Disconnected from channel");
    }

    /// Hand a clip to the channel for fan-out to everyone else
    ///
    /// Completes once the frame is written to the socket. Nothing is queued
    /// or retried.
    pub async fn send(&self, payload: AudioPayload) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let outbound = self
            .shared
            .lock_session()
            .as_ref()
            .map(|s| s.outbound.clone())
            .ok_or(TransportError::NotConnected)?;

        let limit = self.shared.config.max_payload_bytes;
        if payload.len() > limit {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let frame = ClientFrame::AudioBroadcast(BroadcastRequest::from_payload(&payload));
        let json = serde_json::to_string(&frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let (ack, ack_rx) = oneshot::channel();
        outbound
            .send(Outbound {
                frame: WsMessage::Text(json.into()),
                ack,
            })
            .await
            .map_err(|_| TransportError::SendFailed("connection closed".to_string()))?;

        ack_rx
            .await
            .map_err(|_| TransportError::SendFailed("connection closed".to_string()))?
            .map_err(TransportError::SendFailed)?;

        info!(
            "Broadcast {:.1}s clip ({} bytes)",
            payload.duration_seconds,
            payload.len()
        );
        Ok(())
    }
}

#[async_trait]
impl Broadcaster for ChannelTransport {
    async fn broadcast(&self, payload: AudioPayload) -> Result<(), TransportError> {
        self.send(payload).await
    }
}

/// Handshake request carrying the token as query parameter and bearer header
fn build_request(server_url: &str, identity_token: &str) -> Result<Request, TransportError> {
    let mut url = Url::parse(server_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    url.query_pairs_mut().append_pair("token", identity_token);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {identity_token}"))
        .map_err(|e| TransportError::ConnectFailed(format!("invalid token: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    Ok(request)
}

async fn write_loop(mut write: SplitSink<WsStream, WsMessage>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        let result = write.send(out.frame).await.map_err(|e| e.to_string());
        let failed = result.is_err();
        let _ = out.ack.send(result);
        if failed {
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(mut read: SplitStream<WsStream>, shared: Arc<Shared>, generation: u64) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => shared.handle_text(&text),
            Ok(WsMessage::Close(frame)) => {
                info!("Channel closed connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Channel socket error: {}", e);
                break;
            }
        }
    }
    shared.connection_lost(generation);
}
