//! Relay wire protocol for `TaskSync` signaling.
//!
//! Defines the [`RelayMessage`] enum that is postcard-encoded and sent over
//! WebSocket binary frames between clients and the relay server. The relay
//! reads only routing metadata (`room_id`, `to`); negotiation payloads are
//! opaque bytes and mutations are forwarded untouched.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::task::TaskMutation;

/// A directed negotiation envelope (offer, answer, or ICE candidate).
///
/// The `from` field is overwritten by the relay server with the sender's
/// connection id before forwarding, so receivers can trust it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    /// Sender's connection id (stamped by the relay).
    pub from: String,
    /// Target connection id (used by the relay for routing).
    pub to: String,
    /// Opaque negotiation payload produced by the direct transport provider.
    pub payload: Vec<u8>,
}

impl Negotiation {
    /// Builds an outbound envelope; `from` is left for the relay to fill in.
    pub fn to(to: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            from: String::new(),
            to: to.into(),
            payload,
        }
    }
}

/// Messages exchanged between clients and the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Server tells a freshly accepted connection its id.
    Welcome {
        /// Connection id assigned by the relay.
        conn_id: String,
    },

    /// Client asks to join a room.
    JoinRoom {
        /// Room to join.
        room_id: String,
    },

    /// Client leaves a room.
    LeaveRoom {
        /// Room to leave.
        room_id: String,
    },

    /// Server replies to a join with the other members of the room.
    RoomPeers {
        /// The room that was joined.
        room_id: String,
        /// Member connection ids, excluding the joiner, in sorted order.
        peers: Vec<String>,
    },

    /// Server tells room members that a connection joined.
    PeerJoined {
        /// The room.
        room_id: String,
        /// The connection that joined.
        conn_id: String,
    },

    /// Server tells room members that a connection left or disconnected.
    PeerLeft {
        /// The room.
        room_id: String,
        /// The connection that left.
        conn_id: String,
    },

    /// Session description offer.
    Offer(Negotiation),

    /// Session description answer.
    Answer(Negotiation),

    /// Incremental connectivity candidate.
    IceCandidate(Negotiation),

    /// A task mutation broadcast to the rest of the room.
    ///
    /// The relay overwrites `from` with the sender's connection id.
    Mutation {
        /// Room to broadcast into.
        room_id: String,
        /// Originating connection id (stamped by the relay).
        from: String,
        /// The mutation itself.
        mutation: TaskMutation,
    },
}

/// Reasons a decoded envelope is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// A required field is empty.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// The message kind is only ever sent by the relay.
    #[error("{0} is a relay-to-client message")]
    WrongDirection(&'static str),
}

impl RelayMessage {
    /// Short name of the message kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::RoomPeers { .. } => "room-peers",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Mutation { .. } => "mutation",
        }
    }

    /// Checks a message received from a client before the relay acts on it.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MissingField`] when a routing field is empty,
    /// or [`EnvelopeError::WrongDirection`] for relay-only message kinds.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        match self {
            Self::Welcome { .. }
            | Self::RoomPeers { .. }
            | Self::PeerJoined { .. }
            | Self::PeerLeft { .. } => Err(EnvelopeError::WrongDirection(self.kind())),
            Self::JoinRoom { room_id } | Self::LeaveRoom { room_id } => {
                require(room_id, "room_id")
            }
            Self::Offer(n) | Self::Answer(n) | Self::IceCandidate(n) => require(&n.to, "to"),
            Self::Mutation {
                room_id, mutation, ..
            } => {
                require(room_id, "room_id")?;
                require(mutation.task_id().as_str(), "task_id")
            }
        }
    }
}

fn require(value: &str, field: &'static str) -> Result<(), EnvelopeError> {
    if value.is_empty() {
        Err(EnvelopeError::MissingField(field))
    } else {
        Ok(())
    }
}

/// Encodes a [`RelayMessage`] into bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode(msg: &RelayMessage) -> Result<Vec<u8>, CodecError> {
    codec::encode(msg)
}

/// Decodes a [`RelayMessage`] from bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a valid message.
pub fn decode(bytes: &[u8]) -> Result<RelayMessage, CodecError> {
    codec::decode(bytes)
}
