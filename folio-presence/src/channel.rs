//! Presence channel policy: welcome, count fan-out and liveness.
//!
//! Every state change runs to completion, including its broadcast, before
//! the next one starts. Delivery is best-effort: a connection whose
//! transport rejects a frame is treated as dead and removed, which in turn
//! broadcasts the decremented count to the survivors.
//!
//! ```text
//! connect(C)          C ◄── welcome{id:C, count:n}
//!                     every other ◄── userCount{count:n}
//! disconnect(C)       every remaining ◄── userCount{count:n-1}
//! sweep()             silent since last sweep → disconnect
//!                     everyone else ◄── ping
//! ```

use std::collections::VecDeque;

use crate::protocol::{ClientId, ClientMessage, Frame, ServerMessage};
use crate::registry::{Registry, RegistryError, Transport};

/// Counters for monitoring the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub admitted: u64,
    pub removed: u64,
    /// Count broadcasts that reached at least one recipient
    pub broadcasts: u64,
    pub failed_deliveries: u64,
    /// Removals caused by a missed liveness probe
    pub reaped: u64,
    pub malformed_messages: u64,
}

/// The registry plus the policy that keeps every client's count in sync.
pub struct PresenceChannel<T> {
    registry: Registry<T>,
    stats: ChannelStats,
}

impl<T: Transport> PresenceChannel<T> {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry<T>) -> Self {
        Self {
            registry,
            stats: ChannelStats::default(),
        }
    }

    /// Admit a connection, welcome it and tell everyone else the new count.
    pub fn connect(&mut self, transport: T) -> Result<ClientId, RegistryError> {
        let id = self.registry.admit(transport)?;
        self.stats.admitted += 1;
        let count = self.count();
        log::info!("Visitor {id} connected ({count} online)");

        let mut dead = Vec::new();
        match ServerMessage::welcome(id.clone(), count).to_frame() {
            Ok(frame) => {
                if !self.deliver(&id, &frame) {
                    dead.push(id.clone());
                }
            }
            Err(e) => log::error!("Failed to encode welcome for {id}: {e}"),
        }
        dead.extend(self.broadcast_count(Some(&id)));
        self.bury(dead);

        Ok(id)
    }

    /// Remove a connection and broadcast the new count to those remaining.
    ///
    /// Returns `false` if the id was not admitted (already removed).
    pub fn disconnect(&mut self, id: &ClientId) -> bool {
        let removed = self.bury(vec![id.clone()]);
        if removed.is_empty() {
            log::debug!("Ignoring removal of unknown visitor {id}");
            false
        } else {
            true
        }
    }

    /// Record a liveness reply.
    pub fn acknowledge(&mut self, id: &ClientId) -> bool {
        self.registry.mark_alive(id)
    }

    /// Handle a text frame received from a client. Malformed input is dropped.
    pub fn handle_inbound(&mut self, id: &ClientId, text: &str) -> Option<ClientMessage> {
        match ClientMessage::decode(text) {
            Ok(msg) => {
                log::trace!("Visitor {id} sent {msg:?}");
                if msg.is_liveness_reply() {
                    self.acknowledge(id);
                }
                Some(msg)
            }
            Err(e) => {
                self.stats.malformed_messages += 1;
                log::warn!("Dropping message from visitor {id}: {e}");
                None
            }
        }
    }

    /// Run one liveness round.
    ///
    /// Connections that have not replied since the previous round are
    /// removed; the rest are marked pending and probed again. Returns the
    /// reaped ids.
    pub fn sweep(&mut self) -> Vec<ClientId> {
        let stale = self.registry.unresponsive();
        // Cascaded delivery failures are removed too but are not reaps
        let reaped: Vec<ClientId> = self
            .bury(stale.clone())
            .into_iter()
            .filter(|id| stale.contains(id))
            .collect();
        self.stats.reaped += reaped.len() as u64;
        for id in &reaped {
            log::info!("Visitor {id} missed its liveness probe");
        }

        self.registry.reset_liveness();
        let frame = match ServerMessage::Ping.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode ping: {e}");
                return reaped;
            }
        };
        let dead = self.fan_out(&frame, None);
        self.bury(dead);

        reaped
    }

    pub fn count(&self) -> u64 {
        self.registry.count() as u64
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.registry.contains(id)
    }

    pub fn registry(&self) -> &Registry<T> {
        &self.registry
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats.clone()
    }

    /// Push the current count to everyone but `except`. Returns connections
    /// whose transport rejected the frame.
    fn broadcast_count(&mut self, except: Option<&ClientId>) -> Vec<ClientId> {
        let count = self.count();
        let frame = match ServerMessage::user_count(count).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode user count: {e}");
                return Vec::new();
            }
        };

        let recipients = self
            .registry
            .iter()
            .filter(|c| Some(c.id()) != except)
            .count();
        if recipients == 0 {
            return Vec::new();
        }

        self.stats.broadcasts += 1;
        log::debug!("Broadcasting count {count} to {recipients} visitors");
        self.fan_out(&frame, except)
    }

    fn fan_out(&mut self, frame: &Frame, except: Option<&ClientId>) -> Vec<ClientId> {
        let mut failed = Vec::new();
        for conn in self.registry.iter() {
            if Some(conn.id()) == except {
                continue;
            }
            if let Err(e) = conn.transport().deliver(frame) {
                log::warn!("Delivery to visitor {} failed: {e}", conn.id());
                failed.push(conn.id().clone());
            }
        }
        self.stats.failed_deliveries += failed.len() as u64;
        failed
    }

    fn deliver(&mut self, id: &ClientId, frame: &Frame) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };
        match conn.transport().deliver(frame) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Delivery to visitor {id} failed: {e}");
                self.stats.failed_deliveries += 1;
                false
            }
        }
    }

    /// Remove each id in turn, broadcasting after every removal. Failed
    /// deliveries during those broadcasts are queued for removal as well.
    fn bury(&mut self, ids: Vec<ClientId>) -> Vec<ClientId> {
        let mut queue: VecDeque<ClientId> = ids.into();
        let mut removed = Vec::new();

        while let Some(id) = queue.pop_front() {
            if self.registry.remove(&id).is_none() {
                continue;
            }
            self.stats.removed += 1;
            log::info!("Visitor {id} disconnected ({} online)", self.count());
            queue.extend(self.broadcast_count(None));
            removed.push(id);
        }

        removed
    }
}

impl<T: Transport> Default for PresenceChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}
