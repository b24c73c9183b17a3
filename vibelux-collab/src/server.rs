//! WebSocket collaboration hub server.
//!
//! Architecture:
//! ```text
//! ws://host/collaborate/{documentId}
//!        │
//!        ▼
//! SyncServer::run() ── accept ── handshake (path → documentId, else 404)
//!        │
//!        ├── conn task (peer 1) ──┐
//!        ├── conn task (peer 2) ──┼── HubRegistry ── DocumentHub (per doc)
//!        └── conn task (peer 3) ──┘
//! ```
//!
//! Connection tasks decode frames and hand them to their document's hub;
//! frames addressed to the peer come back over its bounded channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::PeerId;
use crate::error::{CollabError, Result};
use crate::hub::HubRegistry;
use crate::protocol::{CollaborationEvent, HUB_USER_ID};

/// Path prefix every collaboration endpoint lives under.
pub const ENDPOINT_PREFIX: &str = "/collaborate/";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per document
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it starts missing frames
    pub peer_buffer: usize,
    /// Applied edits kept per document for rebasing late edits
    pub history_limit: usize,
    /// Peers silent this long are left out of the join presence list
    pub presence_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            peer_buffer: 256,
            history_limit: 1024,
            presence_timeout_ms: 600_000,
        }
    }
}

impl ServerConfig {
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub applied_edits: u64,
    pub rejected_edits: u64,
}

pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<HubRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    next_peer_id: Arc<AtomicU64>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        Self {
            registry: Arc::new(HubRegistry::new(config.clone(), stats.clone())),
            config,
            stats,
            next_peer_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| CollabError::Transport(format!("bind {}: {e}", self.config.bind_addr)))?;
        log::info!("Collaboration hub listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| CollabError::Transport(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, peer_id, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        peer_id: PeerId,
        registry: Arc<HubRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<()> {
        let mut document_id = None;
        let route = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            match document_id_from_path(request.uri().path()) {
                Some(id) => {
                    document_id = Some(id.to_string());
                    Ok(response)
                }
                None => {
                    log::warn!("Rejecting {addr}: unknown path {}", request.uri().path());
                    let mut reject = ErrorResponse::new(Some("unknown endpoint".to_string()));
                    *reject.status_mut() = StatusCode::NOT_FOUND;
                    Err(reject)
                }
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, route).await?;
        let Some(document_id) = document_id else {
            return Err(CollabError::Transport("handshake finished without a document id".into()));
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (hub, mut outbound) = match registry.join(&document_id, peer_id).await {
            Ok(joined) => joined,
            Err(e) => {
                let refusal = CollaborationEvent::error(HUB_USER_ID, e.to_string()).encode()?;
                let _ = ws_sender.send(Message::Text(refusal.into())).await;
                let _ = ws_sender.close().await;
                stats.write().await.active_connections -= 1;
                return Ok(());
            }
        };
        log::info!("Peer {peer_id} ({addr}) connected to document {document_id}");

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::count(&stats, text.len()).await;
                            CollaborationEvent::decode(text.as_str())
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            Self::count(&stats, bytes.len()).await;
                            CollaborationEvent::decode_bytes(&bytes)
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };
                    match decoded {
                        Ok(event) => {
                            if hub.inbound(peer_id, event).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                    }
                }

                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                            log::warn!("Send to {addr} failed: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        registry.leave(&document_id, peer_id).await;
        stats.write().await.active_connections -= 1;
        Ok(())
    }

    async fn count(stats: &RwLock<ServerStats>, bytes: usize) {
        let mut s = stats.write().await;
        s.total_messages += 1;
        s.total_bytes += bytes as u64;
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<HubRegistry> {
        &self.registry
    }
}

/// `/collaborate/{documentId}` → `documentId`.
pub fn document_id_from_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix(ENDPOINT_PREFIX)?.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id)
    }
}
