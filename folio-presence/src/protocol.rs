//! JSON text protocol for the presence channel.
//!
//! Every frame is a JSON object with a `type` discriminator:
//! ```text
//! server → client   {"type":"welcome","clientId":"3f9a0c1e22b7","activeUsers":4}
//! server → client   {"type":"userCount","count":5}
//! server → client   {"type":"ping"}
//! client → server   {"type":"pong"}
//! client → server   {"type":"ping"}     (older browser script, same meaning as pong)
//! ```
//!
//! Counts are absolute, never deltas, so a lost frame is repaired by the
//! next one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One encoded text frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Opaque identifier assigned to a connection at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Messages pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Sent once, to the newly admitted connection only.
    #[serde(rename_all = "camelCase")]
    Welcome {
        client_id: ClientId,
        /// Total count including the recipient
        active_users: u64,
    },
    /// Sent to everyone else whenever the count changes.
    UserCount { count: u64 },
    /// Liveness probe
    Ping,
}

impl ServerMessage {
    pub fn welcome(client_id: ClientId, active_users: u64) -> Self {
        Self::Welcome { client_id, active_users }
    }

    pub fn user_count(count: u64) -> Self {
        Self::UserCount { count }
    }

    /// Wire name of the `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::UserCount { .. } => "userCount",
            Self::Ping => "ping",
        }
    }

    /// Serialize to a shareable text frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(ProtocolError::Encode)
    }

    /// Parse a text frame received from the server.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Liveness acknowledgment
    Pong,
    /// Liveness acknowledgment as sent by the original browser script
    Ping,
}

impl ClientMessage {
    /// Whether this message proves the sender is still alive.
    pub fn is_liveness_reply(&self) -> bool {
        matches!(self, Self::Pong | Self::Ping)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Malformed message: {0}")]
    Decode(#[source] serde_json::Error),
}
