//! Registry of live presence connections.
//!
//! The registry is the only place connections are stored. The visitor
//! count is the size of the map, so it can never drift from the set of
//! admitted connections.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{ClientId, Frame};

/// Attempts made to draw a non-colliding identifier before giving up.
pub const MAX_ID_ATTEMPTS: usize = 16;

/// Length of generated identifiers (hex characters).
const GENERATED_ID_LEN: usize = 12;

/// Outbound half of a connection's transport.
///
/// Delivery must never block: the registry is mutated from a single task
/// and one slow peer may not stall the fan-out to everyone else.
pub trait Transport {
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError>;
}

/// Why a frame could not be handed to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Full,
    #[error("transport is closed")]
    Closed,
}

impl Transport for mpsc::Sender<Frame> {
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
        self.try_send(frame.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no unique client id after {attempts} attempts")]
    IdentifierSpaceExhausted { attempts: usize },
}

/// One live transport session.
#[derive(Debug)]
pub struct Connection<T> {
    id: ClientId,
    transport: T,
    /// Cleared at each liveness tick, set again by a reply
    alive: bool,
}

impl<T> Connection<T> {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

type IdSource = Box<dyn FnMut() -> ClientId + Send>;

/// Live connections keyed by identifier.
pub struct Registry<T> {
    connections: HashMap<ClientId, Connection<T>>,
    id_source: IdSource,
}

impl<T> Registry<T> {
    /// Create a registry that draws random identifiers.
    pub fn new() -> Self {
        Self::with_id_source(random_client_id)
    }

    /// Create a registry with a custom identifier generator.
    pub fn with_id_source(source: impl FnMut() -> ClientId + Send + 'static) -> Self {
        Self {
            connections: HashMap::new(),
            id_source: Box::new(source),
        }
    }

    /// Store a new connection under a fresh identifier.
    pub fn admit(&mut self, transport: T) -> Result<ClientId, RegistryError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = (self.id_source)();
            if self.connections.contains_key(&id) {
                log::debug!("Client id {id} already in use, drawing again");
                continue;
            }
            self.connections.insert(
                id.clone(),
                Connection {
                    id: id.clone(),
                    transport,
                    alive: true,
                },
            );
            return Ok(id);
        }
        Err(RegistryError::IdentifierSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Remove a connection. Unknown or already-removed ids are a no-op.
    pub fn remove(&mut self, id: &ClientId) -> Option<Connection<T>> {
        self.connections.remove(id)
    }

    /// Number of admitted connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn get(&self, id: &ClientId) -> Option<&Connection<T>> {
        self.connections.get(id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.connections.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection<T>> {
        self.connections.values()
    }

    /// Record a liveness reply. Returns `false` for unknown ids.
    pub fn mark_alive(&mut self, id: &ClientId) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) => {
                conn.alive = true;
                true
            }
            None => false,
        }
    }

    /// Connections that have not replied since the last [`Self::reset_liveness`].
    pub fn unresponsive(&self) -> Vec<ClientId> {
        self.connections
            .values()
            .filter(|c| !c.alive)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Clear every liveness flag ahead of a new probe round.
    pub fn reset_liveness(&mut self) {
        for conn in self.connections.values_mut() {
            conn.alive = false;
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn random_client_id() -> ClientId {
    // First 12 hex digits of a v4 uuid are all random bits
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(GENERATED_ID_LEN);
    ClientId::new(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential() -> impl FnMut() -> ClientId + Send + 'static {
        let mut next = 0u32;
        move || {
            next += 1;
            ClientId::new(format!("c{next}"))
        }
    }

    #[test]
    fn test_admit_assigns_unique_ids() {
        let mut registry: Registry<()> = Registry::new();
        let a = registry.admit(()).unwrap();
        let b = registry.admit(()).unwrap();

        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 12);
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(&a));
        assert!(registry.contains(&b));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = Registry::with_id_source(sequential());
        let a = registry.admit("a").unwrap();
        let _b = registry.admit("b").unwrap();

        let removed = registry.remove(&a).unwrap();
        assert_eq!(*removed.transport(), "a");
        assert_eq!(registry.count(), 1);

        assert!(registry.remove(&a).is_none());
        assert!(registry.remove(&ClientId::new("never-admitted")).is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_collision_redraws() {
        let mut draws = vec!["dup", "dup", "fresh"].into_iter();
        let mut registry = Registry::with_id_source(move || {
            ClientId::new(draws.next().unwrap_or("spare"))
        });

        assert_eq!(registry.admit(()).unwrap(), ClientId::new("dup"));
        assert_eq!(registry.admit(()).unwrap(), ClientId::new("fresh"));
    }

    #[test]
    fn test_exhausted_identifier_space() {
        let mut registry = Registry::with_id_source(|| ClientId::new("only"));
        registry.admit(()).unwrap();

        let err = registry.admit(()).unwrap_err();
        assert_eq!(
            err,
            RegistryError::IdentifierSpaceExhausted {
                attempts: MAX_ID_ATTEMPTS
            }
        );
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_count_tracks_admit_remove_sequence() {
        let mut registry = Registry::with_id_source(sequential());
        let mut live: Vec<ClientId> = Vec::new();

        // Interleaved admits and removals, including repeats of stale ids
        for step in 0..60u32 {
            if step % 3 == 2 && !live.is_empty() {
                let victim = live.remove((step as usize * 7) % live.len());
                registry.remove(&victim);
                registry.remove(&victim);
            } else {
                live.push(registry.admit(step).unwrap());
            }
            assert_eq!(registry.count(), live.len());
            assert!(live.iter().all(|id| registry.contains(id)));
        }
    }

    #[test]
    fn test_liveness_flags() {
        let mut registry = Registry::with_id_source(sequential());
        let a = registry.admit(()).unwrap();
        let b = registry.admit(()).unwrap();

        assert!(registry.get(&a).unwrap().is_alive());
        assert!(registry.unresponsive().is_empty());

        registry.reset_liveness();
        assert!(registry.mark_alive(&a));
        assert_eq!(registry.unresponsive(), vec![b]);
        assert!(!registry.mark_alive(&ClientId::new("ghost")));
    }

    #[tokio::test]
    async fn test_mpsc_transport_delivery() {
        let (tx, mut rx) = mpsc::channel::<Frame>(1);
        let frame: Frame = Frame::from(r#"{"type":"ping"}"#);

        assert_eq!(tx.deliver(&frame), Ok(()));
        assert_eq!(tx.deliver(&frame), Err(DeliveryError::Full));
        assert_eq!(&*rx.recv().await.unwrap(), r#"{"type":"ping"}"#);

        drop(rx);
        assert_eq!(tx.deliver(&frame), Err(DeliveryError::Closed));
    }
}
