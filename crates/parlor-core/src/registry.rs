//! The closed set of rooms a relay accepts.
//!
//! Rooms are fixed at startup. Nothing is created or destroyed at runtime;
//! only a room's subscription state changes.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Rooms of the reference deployment.
pub const DEFAULT_ROOMS: [&str; 4] = ["ADHD", "OCD", "DEPRESSION", "ANXIETY"];

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No rooms were configured.
    #[error("At least one room must be configured")]
    Empty,

    /// A configured room name is not acceptable.
    #[error("Invalid room name {name:?}: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The same room was configured twice.
    #[error("Duplicate room name: {0}")]
    Duplicate(String),
}

/// A room identifier. Also used verbatim as the backbone channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(Arc<str>);

impl RoomId {
    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RoomId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// The fixed set of valid rooms.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    /// Rooms in configuration order.
    rooms: Vec<RoomId>,
    /// Lookup index.
    index: HashSet<RoomId>,
}

impl RoomRegistry {
    /// Build a registry from configured room names.
    ///
    /// # Errors
    ///
    /// Returns an error if the set is empty, a name is invalid, or a name repeats.
    pub fn new<I, S>(names: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rooms = Vec::new();
        let mut index = HashSet::new();

        for name in names {
            let name = name.as_ref();
            validate_room_name(name).map_err(|reason| RegistryError::InvalidName {
                name: name.to_string(),
                reason,
            })?;

            let room = RoomId(Arc::from(name));
            if !index.insert(room.clone()) {
                return Err(RegistryError::Duplicate(name.to_string()));
            }
            rooms.push(room);
        }

        if rooms.is_empty() {
            return Err(RegistryError::Empty);
        }

        Ok(Self { rooms, index })
    }

    /// Check whether an identifier names a configured room.
    #[must_use]
    pub fn is_valid_room(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Resolve an identifier to its room.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&RoomId> {
        self.index.get(id)
    }

    /// All rooms in configuration order.
    #[must_use]
    pub fn rooms(&self) -> &[RoomId] {
        &self.rooms
    }

    /// Number of configured rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Always false for a successfully built registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        let rooms: Vec<RoomId> = DEFAULT_ROOMS
            .iter()
            .map(|name| RoomId(Arc::from(*name)))
            .collect();
        let index = rooms.iter().cloned().collect();
        Self { rooms, index }
    }
}
