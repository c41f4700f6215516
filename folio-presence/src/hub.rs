//! Single owner of the presence channel.
//!
//! Connection tasks run in parallel on the tokio runtime, but the registry
//! must be mutated serially. The hub owns the [`PresenceChannel`] inside
//! one task and every admit, removal, reply and liveness tick is a command
//! processed to completion, broadcast included, before the next.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelStats, PresenceChannel};
use crate::protocol::{ClientId, Frame};
use crate::registry::RegistryError;
use crate::server::ServerError;

/// Commands buffered between connection tasks and the hub.
const COMMAND_CAPACITY: usize = 1024;

type Outbound = mpsc::Sender<Frame>;

enum Command {
    Admit {
        outbound: Outbound,
        reply: oneshot::Sender<Result<ClientId, RegistryError>>,
    },
    Remove {
        id: ClientId,
    },
    Acknowledge {
        id: ClientId,
    },
    Inbound {
        id: ClientId,
        text: String,
    },
    Count {
        reply: oneshot::Sender<u64>,
    },
    Stats {
        reply: oneshot::Sender<ChannelStats>,
    },
}

/// The actor that owns the channel.
pub struct Hub {
    channel: PresenceChannel<Outbound>,
    commands: mpsc::Receiver<Command>,
    heartbeat: Duration,
}

/// Cloneable handle used by connection tasks to talk to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
}

impl Hub {
    /// Create a hub and its handle. Nothing runs until [`Hub::run`] is polled.
    pub fn new(channel: PresenceChannel<Outbound>, heartbeat: Duration) -> (Self, HubHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let hub = Self {
            channel,
            commands,
            heartbeat,
        };
        (hub, HubHandle { tx })
    }

    /// Spawn a hub with a fresh channel onto the current runtime.
    pub fn spawn(heartbeat: Duration) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(PresenceChannel::new(), heartbeat);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Process commands and liveness ticks until every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        log::debug!("Presence hub started (heartbeat {:?})", self.heartbeat);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.dispatch(cmd),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let reaped = self.channel.sweep();
                    if !reaped.is_empty() {
                        log::info!(
                            "Liveness sweep removed {} visitors ({} online)",
                            reaped.len(),
                            self.channel.count()
                        );
                    }
                }
            }
        }

        log::debug!("Presence hub stopped");
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Admit { outbound, reply } => {
                let result = self.channel.connect(outbound);
                if let Err(ref e) = result {
                    log::error!("Refusing visitor: {e}");
                }
                if let Err(Ok(id)) = reply.send(result) {
                    // Caller went away between asking and hearing back
                    self.channel.disconnect(&id);
                }
            }
            Command::Remove { id } => {
                self.channel.disconnect(&id);
            }
            Command::Acknowledge { id } => {
                self.channel.acknowledge(&id);
            }
            Command::Inbound { id, text } => {
                self.channel.handle_inbound(&id, &text);
            }
            Command::Count { reply } => {
                let _ = reply.send(self.channel.count());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.channel.stats());
            }
        }
    }
}

impl HubHandle {
    /// Admit a connection whose outbound frames go to `outbound`.
    pub async fn admit(&self, outbound: Outbound) -> Result<ClientId, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Admit { outbound, reply })
            .await
            .map_err(|_| ServerError::HubClosed)?;
        let id = rx.await.map_err(|_| ServerError::HubClosed)??;
        Ok(id)
    }

    /// Remove a connection. Safe to call more than once.
    pub async fn remove(&self, id: &ClientId) {
        self.send(Command::Remove { id: id.clone() }).await;
    }

    /// Record a transport-level liveness reply.
    pub async fn acknowledge(&self, id: &ClientId) {
        self.send(Command::Acknowledge { id: id.clone() }).await;
    }

    /// Forward a text frame received from a client.
    pub async fn inbound(&self, id: &ClientId, text: impl Into<String>) {
        self.send(Command::Inbound {
            id: id.clone(),
            text: text.into(),
        })
        .await;
    }

    /// Current number of admitted connections.
    pub async fn count(&self) -> Result<u64, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Count { reply })
            .await
            .map_err(|_| ServerError::HubClosed)?;
        rx.await.map_err(|_| ServerError::HubClosed)
    }

    pub async fn stats(&self) -> Result<ChannelStats, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply })
            .await
            .map_err(|_| ServerError::HubClosed)?;
        rx.await.map_err(|_| ServerError::HubClosed)
    }

    async fn send(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            log::debug!("Presence hub already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;

    fn next_message(rx: &mut mpsc::Receiver<Frame>) -> Option<ServerMessage> {
        rx.try_recv().ok().map(|f| ServerMessage::decode(&f).unwrap())
    }

    #[tokio::test]
    async fn test_admit_and_remove_through_handle() {
        let (handle, _task) = Hub::spawn(Duration::from_secs(60));

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);

        let a = handle.admit(tx_a).await.unwrap();
        let b = handle.admit(tx_b).await.unwrap();
        assert_eq!(handle.count().await.unwrap(), 2);

        assert_eq!(next_message(&mut rx_a), Some(ServerMessage::welcome(a.clone(), 1)));
        assert_eq!(next_message(&mut rx_a), Some(ServerMessage::user_count(2)));
        assert_eq!(next_message(&mut rx_b), Some(ServerMessage::welcome(b.clone(), 2)));

        handle.remove(&b).await;
        handle.remove(&b).await;
        assert_eq!(handle.count().await.unwrap(), 1);
        assert_eq!(next_message(&mut rx_a), Some(ServerMessage::user_count(1)));
        assert_eq!(next_message(&mut rx_a), None);

        // Removal drops the hub's sender, closing B's queue
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_commands_are_serialized() {
        let (handle, _task) = Hub::spawn(Duration::from_secs(60));
        let mut receivers = Vec::new();
        let mut joins = Vec::new();

        for _ in 0..20 {
            let (tx, rx) = mpsc::channel(64);
            receivers.push(rx);
            let h = handle.clone();
            joins.push(tokio::spawn(async move { h.admit(tx).await.unwrap() }));
        }
        for j in joins {
            j.await.unwrap();
        }

        assert_eq!(handle.count().await.unwrap(), 20);
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.admitted, 20);

        // Every welcome count is distinct: no two admissions observed the same state
        let mut welcomed: Vec<u64> = receivers
            .iter_mut()
            .filter_map(|rx| match next_message(rx) {
                Some(ServerMessage::Welcome { active_users, .. }) => Some(active_users),
                _ => None,
            })
            .collect();
        welcomed.sort_unstable();
        assert_eq!(welcomed, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reaps_silent_connection() {
        let (handle, _task) = Hub::spawn(Duration::from_secs(30));
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = handle.admit(tx_a).await.unwrap();
        let _b = handle.admit(tx_b).await.unwrap();

        // First probe round
        tokio::time::sleep(Duration::from_secs(31)).await;
        handle.inbound(&a, r#"{"type":"pong"}"#).await;

        // Second round reaps B only
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.count().await.unwrap(), 1);

        let mut seen = Vec::new();
        while let Some(msg) = next_message(&mut rx_a) {
            seen.push(msg);
        }
        let counts: Vec<u64> = seen
            .iter()
            .filter_map(|m| match m {
                ServerMessage::UserCount { count } => Some(*count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![2, 1]);

        // B's queue drains its pending frames and then closes
        while rx_b.recv().await.is_some() {}
        assert_eq!(handle.stats().await.unwrap().reaped, 1);
    }
}
