//! WebSocket presence server.
//!
//! Architecture:
//! ```text
//! Tab A ──┐                         ┌── pump A ──┐
//! Tab B ──┼── TcpListener ── /ws ───┼── pump B ──┼── HubHandle ── Hub ── PresenceChannel
//! Tab C ──┘   (accept loop)         └── pump C ──┘     (mpsc)     (one task)
//! ```
//!
//! Each connection gets a pump task that forwards inbound text frames to
//! the hub and writes the frames the hub queues for it. When the hub drops
//! a connection (liveness timeout, failed delivery) its queue closes and
//! the pump shuts the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{Hub, HubHandle};
use crate::protocol::Frame;
use crate::registry::RegistryError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Only upgrade requests for this path are accepted
    pub ws_path: String,
    /// Seconds between liveness probes; a visitor silent for a whole
    /// interval is dropped
    pub heartbeat_interval_secs: u64,
    /// Frames buffered per connection before it counts as dead
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            ws_path: "/ws".to_string(),
            heartbeat_interval_secs: 30,
            outbound_capacity: 64,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Per-connection queue size, at least one frame.
    pub fn outbound_buffer(&self) -> usize {
        self.outbound_capacity.max(1)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub messages_received: u64,
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Presence hub is not running")]
    HubClosed,
}

/// The presence server.
pub struct PresenceServer {
    config: ServerConfig,
    stats: Arc<RwLock<ServerStats>>,
}

/// A server whose listener is bound and whose hub is running.
pub struct BoundServer {
    listener: TcpListener,
    config: ServerConfig,
    stats: Arc<RwLock<ServerStats>>,
    hub: HubHandle,
    hub_task: JoinHandle<()>,
}

impl PresenceServer {
    /// Create a new presence server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the listener and start the hub.
    pub async fn bind(&self) -> Result<BoundServer, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let (hub, hub_task) = Hub::spawn(self.config.heartbeat_interval());
        log::info!(
            "Presence server listening on {} (path {})",
            listener.local_addr()?,
            self.config.ws_path
        );
        Ok(BoundServer {
            listener,
            config: self.config.clone(),
            stats: self.stats.clone(),
            hub,
            hub_task,
        })
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.bind().await?.serve().await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the hub, for querying the live count.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<(), ServerError> {
        let BoundServer {
            listener,
            config,
            stats,
            hub,
            hub_task,
        } = self;

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(ServerError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = hub.clone();
            let stats = stats.clone();
            let config = config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, stats, config).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        };

        hub_task.abort();
        result
    }
}

/// Upgrade one TCP stream and pump frames until either side gives up.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let expected_path = config.ws_path.clone();
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected_path {
            Ok(resp)
        } else {
            let mut reject = ErrorResponse::new(Some(format!(
                "no presence channel at {}",
                req.uri().path()
            )));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            Err(reject)
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            stats.write().await.rejected_handshakes += 1;
            return Err(e.into());
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(config.outbound_buffer());
    let client_id = hub.admit(outbound).await?;

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::debug!("WebSocket from {addr} admitted as {client_id}");

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.write().await.messages_received += 1;
                        hub.inbound(&client_id, text.as_str()).await;
                    }

                    Some(Ok(Message::Pong(_))) => {
                        hub.acknowledge(&client_id).await;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Ok(Message::Binary(data))) => {
                        log::warn!("Dropping {}-byte binary frame from {client_id}", data.len());
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed by {client_id}");
                        break;
                    }

                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {client_id}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                            log::warn!("Write to {client_id} failed: {e}");
                            break;
                        }
                    }
                    None => {
                        // Hub released this connection
                        log::debug!("Presence channel dropped {client_id}");
                        break;
                    }
                }
            }
        }
    }

    hub.remove(&client_id).await;
    let _ = ws_sender.close().await;

    let mut s = stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);

    Ok(())
}
