//! Event types for the Parlor protocol.
//!
//! Every event is a JSON object of the form `{"event": <name>, "data": <payload>}`.
//! Event names match the ones existing room-chat clients already emit.

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

use crate::codec::{self, ProtocolError};

/// A chat message as published to the backbone and fanned out to clients.
///
/// The color is copied from the sender at publish time so recipients can
/// render attribution without a membership lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Room the message was sent into.
    pub room: String,
    /// Message text.
    #[serde(rename = "message")]
    pub body: String,
    /// Sender's display color, `rgb(r,g,b)`.
    pub color: String,
    /// Sending connection, only stamped when echo to the sender is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(room: impl Into<String>, body: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            body: body.into(),
            color: color.into(),
            sender: None,
        }
    }

    /// Stamp the envelope with the sending connection.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Serialize to the backbone payload format.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_payload(&self) -> Result<String, ProtocolError> {
        codec::encode_json(self)
    }

    /// Parse a backbone payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid envelope.
    pub fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        codec::decode_json(payload)
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Join a room, leaving the current one first.
    #[serde(rename = "joinRoom")]
    JoinRoom {
        /// Room identifier.
        room: String,
    },

    /// Leave the current room. Any `data` (absent, `null`, `{}`) is ignored.
    #[serde(rename = "leaveRoom", deserialize_with = "ignore_data")]
    LeaveRoom,

    /// Send a message into the current room.
    #[serde(rename = "event:message")]
    Message {
        /// Message text.
        message: String,
    },
}

impl ClientEvent {
    /// Create a `joinRoom` event.
    #[must_use]
    pub fn join_room(room: impl Into<String>) -> Self {
        ClientEvent::JoinRoom { room: room.into() }
    }

    /// Create an `event:message` event.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        ClientEvent::Message {
            message: message.into(),
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "joinRoom",
            ClientEvent::LeaveRoom => "leaveRoom",
            ClientEvent::Message { .. } => "event:message",
        }
    }
}

fn ignore_data<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: Deserializer<'de>,
{
    IgnoredAny::deserialize(deserializer).map(|_| ())
}

/// Events sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Handshake completed; carries the ephemeral handle and display color.
    #[serde(rename = "connected")]
    Connected {
        /// Connection identifier assigned by the relay.
        connection_id: String,
        /// Display color for this connection's messages.
        color: String,
    },

    /// A message published into the client's room.
    #[serde(rename = "message")]
    Message(Envelope),
}

impl ServerEvent {
    /// Create a `connected` event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, color: impl Into<String>) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            color: color.into(),
        }
    }
}
