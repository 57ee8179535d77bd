//! WebSocket server hosting the sync gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── GraphStore (persist first)
//!             ├── SyncGateway ─────┤
//! Client B ──┘    (per socket)     └── FanoutBridge ── Broker (optional)
//!                                          │
//!                                   RoomManager / BroadcastGroup
//!                          ┌───────────────┼───────────────┐
//!                          ▼               ▼               ▼
//!                       Client A        Client B        Client C
//! ```
//!
//! Each socket is authenticated during the upgrade handshake, then served by
//! one task reading frames plus one writer task draining its outbox.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use weave_core::{ValidationConfig, DEFAULT_MAX_OUT_DEGREE};

use crate::auth::{credentials_from_request, AuthError, Authenticator};
use crate::broadcast::RoomManager;
use crate::fanout::{Broker, FanoutBridge, FanoutConfig, DEFAULT_FANOUT_CHANNEL, DEFAULT_PUBLISH_RETRIES};
use crate::gateway::SyncGateway;
use crate::protocol::ServerFrame;
use crate::store::GraphStore;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Deliveries buffered per room member before it lags
    pub broadcast_capacity: usize,
    /// Frames buffered per socket before senders wait
    pub outbox_capacity: usize,
    /// Out-degree above which edge creation warns
    pub max_out_degree: usize,
    /// Broker channel shared by all instances
    pub fanout_channel: String,
    /// Also emit hyphenated legacy event names
    pub emit_legacy_aliases: bool,
    /// Publish retries before falling back to local delivery
    pub publish_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            outbox_capacity: 256,
            max_out_degree: DEFAULT_MAX_OUT_DEGREE,
            fanout_channel: DEFAULT_FANOUT_CHANNEL.to_string(),
            emit_legacy_aliases: true,
            publish_retries: DEFAULT_PUBLISH_RETRIES,
        }
    }
}

impl ServerConfig {
    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            channel: self.fanout_channel.clone(),
            publish_retries: self.publish_retries,
            emit_legacy_aliases: self.emit_legacy_aliases,
        }
    }

    pub fn validation_config(&self) -> ValidationConfig {
        ValidationConfig {
            max_out_degree: self.max_out_degree,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
}

struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
}

impl AtomicServerStats {
    fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<SyncGateway>,
    fanout: Arc<FanoutBridge>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Single-instance server: events never leave this process.
    pub fn new(config: ServerConfig, store: Arc<dyn GraphStore>, auth: Arc<dyn Authenticator>) -> Self {
        Self::build(config, store, auth, None)
    }

    /// Server that fans events out to other instances through `broker`.
    pub fn with_broker(
        config: ServerConfig,
        store: Arc<dyn GraphStore>,
        auth: Arc<dyn Authenticator>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self::build(config, store, auth, Some(broker))
    }

    fn build(
        config: ServerConfig,
        store: Arc<dyn GraphStore>,
        auth: Arc<dyn Authenticator>,
        broker: Option<Arc<dyn Broker>>,
    ) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        let fanout = Arc::new(match broker {
            Some(broker) => FanoutBridge::with_broker(rooms.clone(), config.fanout_config(), broker),
            None => FanoutBridge::local_only(rooms.clone(), config.fanout_config()),
        });
        let gateway = Arc::new(SyncGateway::new(
            store,
            rooms,
            fanout.clone(),
            config.validation_config(),
            config.outbox_capacity,
        ));
        Self {
            config,
            gateway,
            fanout,
            auth,
            stats: Arc::new(AtomicServerStats::new()),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.fanout.start().await;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Sync server listening on {} ({})",
            self.config.bind_addr,
            if self.fanout.is_distributed() { "fanout" } else { "local-only" }
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, gateway, auth, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<SyncGateway>,
        auth: Arc<dyn Authenticator>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut token: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            token = credentials_from_request(request);
            Ok::<Response, ErrorResponse>(response)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let identity = match token {
            Some(token) => auth.authenticate(&token).await,
            None => Err(AuthError::MissingCredentials),
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::info!("Rejecting connection from {addr}: {e}");
                let frame = ServerFrame::error("unauthorized", &e.to_string(), None).to_text()?;
                ws_sender.send(Message::Text(frame.into())).await?;
                ws_sender.close().await?;
                return Ok(());
            }
        };

        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let (mut conn, mut outbox_rx) = gateway.connect(identity);
        log::info!("WebSocket connection {} established from {addr}", conn.socket_id());

        let writer = tokio::spawn(async move {
            while let Some(text) = outbox_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    log::debug!("Write to {addr} failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    gateway.handle_text(&mut conn, text.as_str()).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => {
                    log::debug!("Ignoring binary frame from {addr}");
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Read from {addr} failed: {e}");
                    break;
                }
            }
        }

        gateway.disconnect(conn).await;
        writer.abort();
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn gateway(&self) -> &Arc<SyncGateway> {
        &self.gateway
    }

    pub fn fanout(&self) -> &Arc<FanoutBridge> {
        &self.fanout
    }
}
