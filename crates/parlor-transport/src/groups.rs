//! Broadcast groups over per-connection outbound queues.

use dashmap::DashMap;
use parlor_core::{ConnectionId, RoomId, Transport};
use parlor_protocol::ServerEvent;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receiving end of a connection's outbound queue.
pub type Outbound = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Registered connections and their room groups.
#[derive(Debug, Default)]
pub struct BroadcastGroups {
    /// Outbound queue per connection.
    sinks: DashMap<ConnectionId, mpsc::UnboundedSender<Arc<ServerEvent>>>,
    /// Group members per room.
    groups: DashMap<RoomId, HashSet<ConnectionId>>,
}

impl BroadcastGroups {
    /// Create an empty set of groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning its outbound queue.
    ///
    /// Registering an existing connection replaces its queue.
    pub fn register(&self, connection: &ConnectionId) -> Outbound {
        let (sender, receiver) = mpsc::unbounded_channel();
        if self.sinks.insert(connection.clone(), sender).is_some() {
            debug!(connection = %connection, "Replaced outbound queue");
        }
        receiver
    }

    /// Drop a connection's queue and remove it from every group.
    pub fn unregister(&self, connection: &ConnectionId) {
        self.sinks.remove(connection);
        self.groups.retain(|_, members| {
            members.remove(connection);
            !members.is_empty()
        });
        debug!(connection = %connection, "Unregistered from transport");
    }

    /// Number of connections in a room's group.
    #[must_use]
    pub fn group_size(&self, room: &str) -> usize {
        self.groups.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }

    fn deliver(&self, connection: &ConnectionId, event: &Arc<ServerEvent>) -> bool {
        match self.sinks.get(connection) {
            Some(sink) => sink.send(event.clone()).is_ok(),
            None => false,
        }
    }
}

impl Transport for BroadcastGroups {
    fn join_group(&self, connection: &ConnectionId, room: &RoomId) {
        self.groups
            .entry(room.clone())
            .or_default()
            .insert(connection.clone());
    }

    fn leave_group(&self, connection: &ConnectionId, room: &RoomId) {
        self.groups.remove_if_mut(room, |_, members| {
            members.remove(connection);
            members.is_empty()
        });
    }

    fn emit_to_group(
        &self,
        room: &RoomId,
        event: ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        // Snapshot membership so no group lock is held while sending.
        let members: Vec<ConnectionId> = match self.groups.get(room) {
            Some(members) => members
                .iter()
                .filter(|id| Some(*id) != except)
                .cloned()
                .collect(),
            None => return 0,
        };

        let event = Arc::new(event);
        let delivered = members
            .iter()
            .filter(|member| self.deliver(member, &event))
            .count();

        trace!(room = %room, members = members.len(), delivered, "Emitted to group");
        delivered
    }

    fn emit_to(&self, connection: &ConnectionId, event: ServerEvent) -> bool {
        self.deliver(connection, &Arc::new(event))
    }

    fn name(&self) -> &'static str {
        "broadcast-groups"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_core::RoomRegistry;
    use parlor_protocol::Envelope;

    fn room(name: &str) -> RoomId {
        RoomRegistry::default().get(name).cloned().unwrap()
    }

    fn message(body: &str) -> ServerEvent {
        ServerEvent::Message(Envelope::new("OCD", body, "rgb(1,2,3)"))
    }

    #[tokio::test]
    async fn test_group_fanout() {
        let groups = BroadcastGroups::new();
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        let c = ConnectionId::from("c");
        let mut rx_a = groups.register(&a);
        let mut rx_b = groups.register(&b);
        let mut rx_c = groups.register(&c);

        groups.join_group(&a, &room("OCD"));
        groups.join_group(&b, &room("OCD"));
        groups.join_group(&c, &room("ADHD"));

        assert_eq!(groups.emit_to_group(&room("OCD"), message("hi"), None), 2);

        assert_eq!(*rx_a.recv().await.unwrap(), message("hi"));
        assert_eq!(*rx_b.recv().await.unwrap(), message("hi"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_fanout_except() {
        let groups = BroadcastGroups::new();
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        let mut rx_a = groups.register(&a);
        let mut rx_b = groups.register(&b);
        groups.join_group(&a, &room("OCD"));
        groups.join_group(&b, &room("OCD"));

        assert_eq!(
            groups.emit_to_group(&room("OCD"), message("quiet"), Some(&a)),
            1
        );
        assert!(rx_a.try_recv().is_err());
        assert_eq!(*rx_b.recv().await.unwrap(), message("quiet"));
    }

    #[test]
    fn test_join_leave_idempotent() {
        let groups = BroadcastGroups::new();
        let a = ConnectionId::from("a");
        let _rx = groups.register(&a);

        groups.join_group(&a, &room("ANXIETY"));
        groups.join_group(&a, &room("ANXIETY"));
        assert_eq!(groups.group_size("ANXIETY"), 1);

        groups.leave_group(&a, &room("ANXIETY"));
        groups.leave_group(&a, &room("ANXIETY"));
        assert_eq!(groups.group_size("ANXIETY"), 0);
    }

    #[test]
    fn test_unregister_clears_membership() {
        let groups = BroadcastGroups::new();
        let a = ConnectionId::from("a");
        let rx = groups.register(&a);
        groups.join_group(&a, &room("DEPRESSION"));

        groups.unregister(&a);
        drop(rx);

        assert_eq!(groups.group_size("DEPRESSION"), 0);
        assert_eq!(groups.connection_count(), 0);
        assert!(!groups.emit_to(&a, message("gone")));
    }

    #[test]
    fn test_closed_queue_not_counted() {
        let groups = BroadcastGroups::new();
        let a = ConnectionId::from("a");
        let rx = groups.register(&a);
        groups.join_group(&a, &room("OCD"));
        drop(rx);

        assert_eq!(groups.emit_to_group(&room("OCD"), message("lost"), None), 0);
    }
}
