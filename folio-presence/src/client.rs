//! Presence client: one outbound connection per owning view.
//!
//! State is derived only from server messages: the visitor count is always
//! replaced, never incremented, so duplicated or repeated counts are
//! harmless.
//!
//! ```text
//!   open()                handshake ok            close / error / drop
//! ──────► Connecting ───────────────────► Open ───────────────────────► Closed
//!              │                                                         ▲
//!              └──────────────── handshake failed ───────────────────────┘
//! ```
//!
//! `Closed` is terminal. Reconnecting means opening a new client.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientId, ClientMessage, ServerMessage};

/// Buffered events for the owning view.
const EVENT_CAPACITY: usize = 256;

/// Buffered outgoing messages.
const OUTGOING_CAPACITY: usize = 64;

/// Default path of the presence endpoint.
pub const DEFAULT_CHANNEL_PATH: &str = "/ws";

/// Build the channel URL for a page served from `host`.
///
/// Pages loaded over https must use the encrypted transport.
pub fn channel_url(secure: bool, host: &str, path: &str) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    if path.starts_with('/') {
        format!("{scheme}://{host}{path}")
    } else {
        format!("{scheme}://{host}/{path}")
    }
}

/// Client connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Connecting,
    Open,
    Closed,
}

/// Presence as seen from one tab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceState {
    pub connected: bool,
    /// Assigned by the server's welcome; cleared on disconnect
    pub client_id: Option<ClientId>,
    pub visitor_count: u64,
    pub last_message: Option<ServerMessage>,
}

impl PresenceState {
    /// Fold one server message into the state.
    ///
    /// Returns the reply the client owes the server, if any.
    pub fn apply(&mut self, msg: &ServerMessage) -> Option<ClientMessage> {
        self.last_message = Some(msg.clone());
        match msg {
            ServerMessage::Welcome {
                client_id,
                active_users,
            } => {
                match &self.client_id {
                    None => self.client_id = Some(client_id.clone()),
                    Some(existing) if existing != client_id => {
                        log::warn!("Ignoring second welcome ({client_id}), already {existing}");
                    }
                    Some(_) => {}
                }
                self.visitor_count = *active_users;
                None
            }
            ServerMessage::UserCount { count } => {
                self.visitor_count = *count;
                None
            }
            ServerMessage::Ping => Some(ClientMessage::Pong),
        }
    }

    /// Transport went away. The last count is kept for the display layer.
    pub fn mark_closed(&mut self) {
        self.connected = false;
        self.client_id = None;
    }
}

/// Events emitted by the presence client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Handshake completed
    Opened,
    /// Server assigned our identifier
    Welcomed { client_id: ClientId, count: u64 },
    /// Visitor count changed
    CountChanged(u64),
    /// Connection closed or failed; terminal
    Closed,
}

/// Phase and state live under one lock so readers never see them disagree.
struct Session {
    phase: ClientPhase,
    state: PresenceState,
}

struct Shared {
    session: RwLock<Session>,
}

impl Shared {
    async fn open(&self) {
        let mut session = self.session.write().await;
        session.phase = ClientPhase::Open;
        session.state.connected = true;
    }

    async fn close(&self) {
        let mut session = self.session.write().await;
        session.phase = ClientPhase::Closed;
        session.state.mark_closed();
    }
}

/// Hand an event to the owner without waiting. An owner that never drains
/// its receiver loses events but the connection keeps running.
fn emit(events: &mpsc::Sender<PresenceEvent>, event: PresenceEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::debug!("Presence event queue full, dropping {event:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// The presence client.
///
/// Dropping the client (or calling [`PresenceClient::close`]) closes the
/// connection.
pub struct PresenceClient {
    url: String,
    shared: Arc<Shared>,
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
}

impl PresenceClient {
    /// Start connecting to `url`. Returns immediately in `Connecting`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(url: impl Into<String>) -> (Self, mpsc::Receiver<PresenceEvent>) {
        let url = url.into();
        let shared = Arc::new(Shared {
            session: RwLock::new(Session {
                phase: ClientPhase::Connecting,
                state: PresenceState::default(),
            }),
        });
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);

        tokio::spawn(drive(url.clone(), shared.clone(), outgoing_rx, event_tx));

        let client = Self {
            url,
            shared,
            outgoing_tx: Some(outgoing_tx),
        };
        (client, event_rx)
    }

    /// Send a message if the connection is open.
    ///
    /// Returns `false` and logs a warning otherwise; never fails.
    pub async fn send(&self, msg: ClientMessage) -> bool {
        if self.phase().await != ClientPhase::Open {
            log::warn!("Presence channel is not open, dropping {msg:?}");
            return false;
        }
        let Some(tx) = &self.outgoing_tx else {
            log::warn!("Presence client closed, dropping {msg:?}");
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Presence channel unable to send: {e}");
                false
            }
        }
    }

    /// Close the connection. The driver reports [`PresenceEvent::Closed`].
    pub fn close(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn phase(&self) -> ClientPhase {
        self.shared.session.read().await.phase
    }

    /// Snapshot of the derived presence state.
    pub async fn state(&self) -> PresenceState {
        self.shared.session.read().await.state.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.session.read().await.state.connected
    }

    pub async fn visitor_count(&self) -> u64 {
        self.shared.session.read().await.state.visitor_count
    }

    pub async fn client_id(&self) -> Option<ClientId> {
        self.shared.session.read().await.state.client_id.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Connection task: handshake, then read server frames and write our own.
async fn drive(
    url: String,
    shared: Arc<Shared>,
    mut outgoing_rx: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<PresenceEvent>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::warn!("Presence connection to {url} failed: {e}");
            shared.close().await;
            emit(&events, PresenceEvent::Closed);
            return;
        }
    };

    // The owner may already have closed while the handshake was in flight
    if outgoing_rx.is_closed() {
        let (mut sink, _) = ws_stream.split();
        let _ = sink.close().await;
        shared.close().await;
        emit(&events, PresenceEvent::Closed);
        return;
    }

    shared.open().await;
    log::info!("Presence connection established to {url}");
    emit(&events, PresenceEvent::Opened);

    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let server_msg = match ServerMessage::decode(text.as_str()) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Ignoring presence message: {e}");
                                continue;
                            }
                        };
                        log::trace!("Presence {} received: {server_msg:?}", server_msg.kind());

                        let reply = shared.session.write().await.state.apply(&server_msg);
                        if let Some(reply) = reply {
                            if let Err(e) = send_message(&mut sink, reply).await {
                                log::warn!("Presence reply failed: {e}");
                                break;
                            }
                        }

                        let event = match server_msg {
                            ServerMessage::Welcome { client_id, active_users } => {
                                Some(PresenceEvent::Welcomed { client_id, count: active_users })
                            }
                            ServerMessage::UserCount { count } => Some(PresenceEvent::CountChanged(count)),
                            ServerMessage::Ping => None,
                        };
                        if let Some(evt) = event {
                            emit(&events, evt);
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Presence connection closed");
                        break;
                    }

                    Some(Err(e)) => {
                        log::warn!("Presence connection error: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if let Err(e) = send_message(&mut sink, msg).await {
                            log::warn!("Presence send failed: {e}");
                            break;
                        }
                    }
                    None => {
                        log::debug!("Closing presence connection");
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    shared.close().await;
    emit(&events, PresenceEvent::Closed);
}

async fn send_message<S>(
    sink: &mut S,
    msg: ClientMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frame = msg.to_frame()?;
    sink.send(Message::Text(frame.to_string().into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_channel_url_matches_page_scheme() {
        assert_eq!(channel_url(false, "localhost:5000", "/ws"), "ws://localhost:5000/ws");
        assert_eq!(channel_url(true, "folio.example", DEFAULT_CHANNEL_PATH), "wss://folio.example/ws");
        assert_eq!(channel_url(true, "folio.example", "ws"), "wss://folio.example/ws");
    }

    #[test]
    fn test_welcome_then_count() {
        let mut state = PresenceState {
            connected: true,
            ..PresenceState::default()
        };

        assert_eq!(state.apply(&ServerMessage::welcome(ClientId::new("x7"), 4)), None);
        assert_eq!(state.apply(&ServerMessage::user_count(5)), None);

        assert!(state.connected);
        assert_eq!(state.client_id, Some(ClientId::new("x7")));
        assert_eq!(state.visitor_count, 5);
        assert_eq!(state.last_message, Some(ServerMessage::user_count(5)));
    }

    #[test]
    fn test_close_keeps_last_count() {
        let mut state = PresenceState {
            connected: true,
            ..PresenceState::default()
        };
        state.apply(&ServerMessage::welcome(ClientId::new("x7"), 4));
        state.apply(&ServerMessage::user_count(5));

        state.mark_closed();
        assert!(!state.connected);
        assert_eq!(state.client_id, None);
        assert_eq!(state.visitor_count, 5);
    }

    #[test]
    fn test_identifier_set_once() {
        let mut state = PresenceState::default();
        state.apply(&ServerMessage::welcome(ClientId::new("first"), 1));
        state.apply(&ServerMessage::welcome(ClientId::new("second"), 2));

        assert_eq!(state.client_id, Some(ClientId::new("first")));
        assert_eq!(state.visitor_count, 2);
    }

    #[test]
    fn test_duplicate_counts_idempotent() {
        let mut state = PresenceState::default();
        state.apply(&ServerMessage::user_count(3));
        state.apply(&ServerMessage::user_count(3));
        assert_eq!(state.visitor_count, 3);

        state.apply(&ServerMessage::user_count(2));
        assert_eq!(state.visitor_count, 2);
    }

    #[test]
    fn test_ping_requests_pong() {
        let mut state = PresenceState::default();
        assert_eq!(state.apply(&ServerMessage::Ping), Some(ClientMessage::Pong));
        assert_eq!(state.visitor_count, 0);
    }

    #[tokio::test]
    async fn test_refused_connection_closes() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (client, mut events) = PresenceClient::open(format!("ws://127.0.0.1:{port}/ws"));
        assert_eq!(client.url(), format!("ws://127.0.0.1:{port}/ws"));

        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert_eq!(event, Some(PresenceEvent::Closed));
        assert_eq!(client.phase().await, ClientPhase::Closed);
        assert!(!client.is_connected().await);
        assert!(!client.send(ClientMessage::Pong).await);
    }

    #[tokio::test]
    async fn test_send_while_connecting_is_noop() {
        let (client, _events) = PresenceClient::open("ws://127.0.0.1:9/ws");
        if client.phase().await == ClientPhase::Connecting {
            assert!(!client.send(ClientMessage::Pong).await);
        }
        assert_eq!(client.state().await.client_id, None);
    }

    #[test]
    fn test_emit_drops_when_owner_not_draining() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, PresenceEvent::CountChanged(1));
        emit(&tx, PresenceEvent::CountChanged(2));
        emit(&tx, PresenceEvent::Closed);

        assert_eq!(rx.try_recv().ok(), Some(PresenceEvent::CountChanged(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_closes_atomically() {
        let shared = Shared {
            session: RwLock::new(Session {
                phase: ClientPhase::Connecting,
                state: PresenceState::default(),
            }),
        };
        shared.open().await;
        {
            let session = shared.session.read().await;
            assert_eq!(session.phase, ClientPhase::Open);
            assert!(session.state.connected);
        }

        shared.close().await;
        let session = shared.session.read().await;
        assert_eq!(session.phase, ClientPhase::Closed);
        assert!(!session.state.connected);
    }
}
