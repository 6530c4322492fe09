//! Per-connection state.
//!
//! Each live connection has at most one current room and a display color
//! assigned once at connect time.

use crate::registry::RoomId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Atomic counter keeping generated IDs unique within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A display color, rendered as `rgb(r,g,b)`.
///
/// Colors are not unique across connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Color {
    /// Create a color from channel values.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Draw each channel uniformly from `0..=255`.
    #[must_use]
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    /// Draw a color from the given generator.
    pub fn random_with<R: Rng>(rng: &mut R) -> Self {
        Self {
            r: rng.gen(),
            g: rng.gen(),
            b: rng.gen(),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgb({},{},{})", self.r, self.g, self.b)
    }
}

/// Connection state errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No record exists for the connection.
    #[error("Unknown connection: {0}")]
    Unknown(ConnectionId),

    /// The connection was registered twice.
    #[error("Connection already registered: {0}")]
    AlreadyConnected(ConnectionId),
}

/// State kept for one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Current room, if any.
    pub room: Option<RoomId>,
    /// Display color, fixed for the connection's lifetime.
    pub color: Color,
}

/// Store of per-connection records.
#[derive(Debug, Default)]
pub struct ConnectionState {
    records: DashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionState {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection with a random color and no room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already registered; its
    /// existing color is kept.
    pub fn on_connect(&self, id: &ConnectionId) -> Result<Color, ConnectionError> {
        self.on_connect_with_color(id, Color::random())
    }

    /// Register a new connection with a chosen color.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already registered.
    pub fn on_connect_with_color(
        &self,
        id: &ConnectionId,
        color: Color,
    ) -> Result<Color, ConnectionError> {
        match self.records.entry(id.clone()) {
            Entry::Occupied(_) => Err(ConnectionError::AlreadyConnected(id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(ConnectionRecord { room: None, color });
                debug!(connection = %id, color = %color, "Connection registered");
                Ok(color)
            }
        }
    }

    /// Check whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.records.contains_key(id)
    }

    /// The connection's current room. `None` if it has none or is unknown.
    #[must_use]
    pub fn current_room(&self, id: &ConnectionId) -> Option<RoomId> {
        self.records.get(id).and_then(|record| record.room.clone())
    }

    /// Replace the connection's current room, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn set_room(
        &self,
        id: &ConnectionId,
        room: Option<RoomId>,
    ) -> Result<Option<RoomId>, ConnectionError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| ConnectionError::Unknown(id.clone()))?;
        Ok(std::mem::replace(&mut record.room, room))
    }

    /// The connection's display color. `None` if the connection is unknown.
    #[must_use]
    pub fn color_of(&self, id: &ConnectionId) -> Option<Color> {
        self.records.get(id).map(|record| record.color)
    }

    /// Remove the connection's record. Safe to call for unknown connections.
    pub fn on_disconnect(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        let removed = self.records.remove(id).map(|(_, record)| record);
        if removed.is_some() {
            debug!(connection = %id, "Connection record removed");
        }
        removed
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of connections whose current room is `room`.
    #[must_use]
    pub fn members_of(&self, room: &str) -> usize {
        self.records
            .iter()
            .filter(|record| record.room.as_ref().map(RoomId::as_str) == Some(room))
            .count()
    }
}
