//! # folio-presence: live visitor presence for the portfolio site
//!
//! Tracks who is currently looking at the site and pushes the visitor
//! count to every open tab over a WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket /ws     ┌────────────────┐
//! │ PresenceClient │ ◄───────────────────► │ PresenceServer │
//! │ (per tab)      │      JSON frames      │ (accept loop)  │
//! └───────┬────────┘                       └───────┬────────┘
//!         │                                        │ admit / remove / inbound
//!         ▼                                        ▼
//! ┌────────────────┐                       ┌────────────────┐
//! │ PresenceState  │                       │ Hub (actor)    │
//! │ id + count     │                       │ sole owner     │
//! └───────┬────────┘                       └───────┬────────┘
//!         │                                        │
//!         ▼                                ┌───────┴────────┐
//! ┌────────────────┐                       │PresenceChannel │
//! │ badge / toast  │                       │ Registry +     │
//! │ (consumers)    │                       │ fan-out policy │
//! └────────────────┘                       └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`]: live connections and the visitor count
//! - [`protocol`]: JSON wire messages (`welcome`, `userCount`, `ping`, `pong`)
//! - [`channel`]: welcome/broadcast/liveness policy over the registry
//! - [`hub`]: single task that serializes every registry mutation
//! - [`server`]: WebSocket accept loop and per-connection pumps
//! - [`client`]: outbound presence connection with derived state
//! - [`consumers`]: visitor badge label and new-visitor detection

pub mod protocol;
pub mod registry;
pub mod channel;
pub mod hub;
pub mod server;
pub mod client;
pub mod consumers;

// Re-exports for convenience
pub use protocol::{ClientId, ClientMessage, Frame, ProtocolError, ServerMessage};
pub use registry::{Connection, DeliveryError, Registry, RegistryError, Transport};
pub use channel::{ChannelStats, PresenceChannel};
pub use hub::{Hub, HubHandle};
pub use server::{BoundServer, PresenceServer, ServerConfig, ServerError, ServerStats};
pub use client::{channel_url, ClientPhase, PresenceClient, PresenceEvent, PresenceState};
pub use consumers::{visitor_label, NewVisitor, NewVisitorDetector};
