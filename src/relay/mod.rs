//! Development broadcast relay
//!
//! Accepts WebSocket connections authenticated by a `token` query parameter
//! (or a bearer header), then fans each `audio_broadcast` out to every other
//! participant as an `audio_message`. One connection per participant: a new
//! connection replaces the previous one.

mod tokens;

pub use tokens::{Identity, StaticTokens, TokenVerifier};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::transport::wire::{
    AudioMessageFrame, BroadcastRequest, ClientFrame, ErrorFrame, ServerFrame, DEFAULT_MESSAGE_TYPE,
};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// Per-connection outbound queue depth
const CLIENT_QUEUE: usize = 64;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct Client {
    connection_id: u64,
    tx: mpsc::Sender<String>,
}

struct RelayShared {
    verifier: Arc<dyn TokenVerifier>,
    max_duration_secs: f64,
    clients: RwLock<HashMap<i64, Client>>,
    next_connection: AtomicU64,
}

impl RelayShared {
    /// Register a connection, replacing any earlier one for the same participant
    async fn register(&self, identity: &Identity, tx: mpsc::Sender<String>) -> u64 {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let previous = self.clients.write().await.insert(
            identity.display_id,
            Client { connection_id, tx },
        );
        if previous.is_some() {
            info!("Participant {} reconnected, dropping old connection", identity.display_id);
        }
        connection_id
    }

    async fn unregister(&self, display_id: i64, connection_id: u64) {
        let mut clients = self.clients.write().await;
        if clients
            .get(&display_id)
            .is_some_and(|c| c.connection_id == connection_id)
        {
            clients.remove(&display_id);
        }
    }

    /// Queue `text` for everyone except `sender`; returns how many got it
    async fn fan_out(&self, sender: i64, text: &str) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let clients = self.clients.read().await;
            for (display_id, client) in clients.iter().filter(|(id, _)| **id != sender) {
                match client.tx.try_send(text.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Participant {} is not keeping up, message dropped", display_id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push((*display_id, client.connection_id)),
                }
            }
        }

        for (display_id, connection_id) in dead {
            debug!("Dropping closed connection for participant {}", display_id);
            self.unregister(display_id, connection_id).await;
        }
        delivered
    }

    fn authenticate(&self, request: &Request) -> Option<Identity> {
        let from_query = request.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        });
        let from_header = || {
            request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_string)
        };

        let token = from_query.or_else(from_header)?;
        self.verifier.verify(&token)
    }

    async fn handle_text(&self, identity: &Identity, text: &str, sink: &mut WsSink) -> bool {
        let request = match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::AudioBroadcast(request)) => request,
            Err(e) => {
                debug!("Ignoring frame from {}: {}", identity.display_id, e);
                return send_frame(sink, &error_frame("Unsupported message")).await;
            }
        };

        if request.duration > self.max_duration_secs {
            let detail = format!(
                "Audio message too long (max {} seconds)",
                self.max_duration_secs
            );
            return send_frame(sink, &error_frame(&detail)).await;
        }

        let message = relay_message(identity, request);
        let id = message.id.clone();
        let text = match serde_json::to_string(&ServerFrame::AudioMessage(message)) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode relayed message: {}", e);
                return true;
            }
        };

        let delivered = self.fan_out(identity.display_id, &text).await;
        info!(
            "Relayed {} from participant {} to {} listener(s)",
            id, identity.display_id, delivered
        );
        true
    }
}

fn relay_message(identity: &Identity, request: BroadcastRequest) -> AudioMessageFrame {
    AudioMessageFrame {
        id: Uuid::new_v4().to_string(),
        nft_token_id: identity.display_id,
        wallet_address: identity.wallet_address.clone(),
        audio_data: request.audio_data,
        duration: request.duration,
        timestamp: Utc::now(),
        message_type: DEFAULT_MESSAGE_TYPE.to_string(),
    }
}

fn error_frame(detail: &str) -> ServerFrame {
    ServerFrame::Error(ErrorFrame {
        detail: detail.to_string(),
    })
}

/// Returns false once the socket is unusable
async fn send_frame(sink: &mut WsSink, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode frame: {}", e);
            true
        }
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Invalid token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<RelayShared>) {
    let mut identity = None;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match shared.authenticate(req) {
            Some(id) => {
                identity = Some(id);
                Ok(resp)
            }
            None => Err(unauthorized()),
        }
    })
    .await;

    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let Some(identity) = identity else {
        return;
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_QUEUE);
    let connection_id = shared.register(&identity, tx).await;
    info!("Participant {} connected from {}", identity.display_id, addr);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                // None once a newer connection took over
                let Some(text) = outbound else { break };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !shared.handle_text(&identity, &text, &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Connection error from {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    shared.unregister(identity.display_id, connection_id).await;
    let _ = sink.close().await;
    info!("Participant {} disconnected", identity.display_id);
}

/// Reports on a running relay
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<RelayShared>,
}

impl RelayHandle {
    /// Participants with a live connection
    pub async fn online_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }
}

/// Broadcast relay bound to a TCP port
pub struct ChannelRelay {
    listener: TcpListener,
    shared: Arc<RelayShared>,
}

impl ChannelRelay {
    pub async fn bind(
        config: &RelayConfig,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(RelayError::Bind)?;

        Ok(Self {
            listener,
            shared: Arc::new(RelayShared {
                verifier,
                max_duration_secs: config.max_duration_secs,
                clients: RwLock::new(HashMap::new()),
                next_connection: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Relay listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(stream, addr, self.shared.clone()));
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
}
