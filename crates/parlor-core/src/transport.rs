//! Transport adapter trait.
//!
//! The transport owns the live client connections and a broadcast-group
//! primitive keyed by room. The relay only asks it to move connections
//! between groups and to emit events.

use crate::connection::ConnectionId;
use crate::registry::RoomId;
use parlor_protocol::ServerEvent;

/// Broadcast-group operations the relay needs from a transport.
pub trait Transport: Send + Sync {
    /// Add a connection to a room's broadcast group. Idempotent.
    fn join_group(&self, connection: &ConnectionId, room: &RoomId);

    /// Remove a connection from a room's broadcast group. Idempotent.
    fn leave_group(&self, connection: &ConnectionId, room: &RoomId);

    /// Emit an event to every member of a room's group, optionally skipping
    /// one connection.
    ///
    /// Returns the number of connections the event was handed to.
    fn emit_to_group(
        &self,
        room: &RoomId,
        event: ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize;

    /// Emit an event to a single connection.
    ///
    /// Returns `false` if the connection is gone.
    fn emit_to(&self, connection: &ConnectionId, event: ServerEvent) -> bool;

    /// Get the transport name.
    fn name(&self) -> &'static str;
}
