//! The relay: connection events in, state changes and backbone calls out.
//!
//! Per connection the relay moves between `Unjoined` and `InRoom(room)`.
//! Joining while in another room leaves that room first; joining the room a
//! connection is already in changes nothing. Disconnect leaves the current
//! room and drops the connection's record.
//!
//! No error is ever reported back to a client. [`Relay::handle`] logs and
//! drops failed events; the individual operations return [`RelayError`] so
//! callers can tell the cases apart.

use crate::backbone::{Backbone, BackboneError};
use crate::connection::{Color, ConnectionError, ConnectionId, ConnectionState};
use crate::registry::{RoomId, RoomRegistry};
use crate::subscription::{RoomSnapshot, SubscriptionManager};
use crate::transport::Transport;
use parlor_protocol::{ClientEvent, Envelope, ProtocolError, ServerEvent};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The room is not in the registry.
    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    /// Leave or send from a connection with no current room.
    #[error("Connection {0} is not in a room")]
    NotInRoom(ConnectionId),

    /// The connection has no record.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection was registered twice.
    #[error("Connection already registered: {0}")]
    AlreadyConnected(ConnectionId),

    /// A backbone call failed.
    #[error(transparent)]
    Backbone(#[from] BackboneError),

    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ConnectionError> for RelayError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Unknown(id) => RelayError::UnknownConnection(id),
            ConnectionError::AlreadyConnected(id) => RelayError::AlreadyConnected(id),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deliver a sender's own messages back to it.
    pub echo_to_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    /// Number of registered connections.
    pub connections: usize,
    /// Per-room membership and upstream state.
    pub rooms: Vec<RoomSnapshot>,
}

/// One relay instance.
pub struct Relay {
    registry: RoomRegistry,
    connections: ConnectionState,
    subscriptions: SubscriptionManager,
    transport: Arc<dyn Transport>,
    backbone: Arc<dyn Backbone>,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new(
        registry: RoomRegistry,
        transport: Arc<dyn Transport>,
        backbone: Arc<dyn Backbone>,
    ) -> Self {
        Self::with_config(registry, transport, backbone, RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(
        registry: RoomRegistry,
        transport: Arc<dyn Transport>,
        backbone: Arc<dyn Backbone>,
        config: RelayConfig,
    ) -> Self {
        info!(
            rooms = registry.len(),
            transport = transport.name(),
            backbone = backbone.name(),
            echo_to_sender = config.echo_to_sender,
            "Creating relay"
        );

        Self {
            subscriptions: SubscriptionManager::new(&registry),
            registry,
            connections: ConnectionState::new(),
            transport,
            backbone,
            config,
        }
    }

    /// The room registry.
    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Per-connection state.
    #[must_use]
    pub fn connections(&self) -> &ConnectionState {
        &self.connections
    }

    /// Per-room subscription state.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Register a new connection and greet it with its color.
    ///
    /// The transport must already be able to reach the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already registered.
    pub fn connect(&self, id: &ConnectionId) -> Result<Color, RelayError> {
        let color = self.connections.on_connect(id)?;
        if !self
            .transport
            .emit_to(id, ServerEvent::connected(id.as_str(), color.to_string()))
        {
            debug!(connection = %id, "Connection gone before greeting");
        }
        Ok(color)
    }

    /// Move a connection into a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is invalid or the connection is unknown.
    /// Neither changes any state.
    pub async fn join(&self, id: &ConnectionId, room: &str) -> Result<(), RelayError> {
        let Some(room) = self.registry.get(room).cloned() else {
            return Err(RelayError::InvalidRoom(room.to_string()));
        };
        if !self.connections.contains(id) {
            return Err(RelayError::UnknownConnection(id.clone()));
        }

        match self.connections.current_room(id) {
            Some(current) if current == room => {
                self.transport.join_group(id, &room);
                debug!(connection = %id, room = %room, "Already in room");
                return Ok(());
            }
            Some(previous) => self.leave_room(id, &previous).await?,
            None => {}
        }

        self.transport.join_group(id, &room);
        self.connections.set_room(id, Some(room.clone()))?;
        self.acquire(&room).await;

        debug!(connection = %id, room = %room, "Joined room");
        Ok(())
    }

    /// Take a connection out of its current room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or not in a room.
    pub async fn leave(&self, id: &ConnectionId) -> Result<(), RelayError> {
        if !self.connections.contains(id) {
            return Err(RelayError::UnknownConnection(id.clone()));
        }
        let room = self
            .connections
            .current_room(id)
            .ok_or_else(|| RelayError::NotInRoom(id.clone()))?;

        self.leave_room(id, &room).await
    }

    /// Publish a message into the connection's current room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, not in a room, or the
    /// publish fails.
    pub async fn send(&self, id: &ConnectionId, body: impl Into<String>) -> Result<(), RelayError> {
        let color = self
            .connections
            .color_of(id)
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;
        let room = self
            .connections
            .current_room(id)
            .ok_or_else(|| RelayError::NotInRoom(id.clone()))?;

        let mut envelope = Envelope::new(room.as_str(), body, color.to_string());
        if !self.config.echo_to_sender {
            envelope = envelope.with_sender(id.as_str());
        }
        let payload = envelope.to_payload()?;

        self.backbone.publish(room.as_str(), &payload).await?;
        trace!(connection = %id, room = %room, bytes = payload.len(), "Published message");
        Ok(())
    }

    /// Tear down a connection. Safe for connections that never finished
    /// connecting.
    ///
    /// Returns `true` if a record was removed.
    pub async fn disconnect(&self, id: &ConnectionId) -> bool {
        if let Some(room) = self.connections.current_room(id) {
            if let Err(e) = self.leave_room(id, &room).await {
                warn!(connection = %id, room = %room, error = %e, "Leave on disconnect failed");
            }
        }

        let removed = self.connections.on_disconnect(id).is_some();
        if removed {
            debug!(connection = %id, "Disconnected");
        } else {
            debug!(connection = %id, "Disconnect for unknown connection");
        }
        removed
    }

    /// Dispatch a client event, logging any failure.
    pub async fn handle(&self, id: &ConnectionId, event: ClientEvent) {
        let name = event.name();
        let result = match event {
            ClientEvent::JoinRoom { room } => self.join(id, &room).await,
            ClientEvent::LeaveRoom => self.leave(id).await,
            ClientEvent::Message { message } => self.send(id, message).await,
        };

        if let Err(e) = result {
            warn!(connection = %id, event = name, error = %e, "Event dropped");
        }
    }

    /// Fan a backbone message out to the local members of its room.
    ///
    /// Messages on channels outside the registry are ignored.
    ///
    /// Returns the number of local connections the message was handed to.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid envelope.
    pub fn on_backbone_message(&self, channel: &str, payload: &str) -> Result<usize, RelayError> {
        let Some(room) = self.registry.get(channel) else {
            debug!(channel = %channel, "Ignoring message on unknown channel");
            return Ok(0);
        };

        let mut envelope = Envelope::from_payload(payload)?;
        if envelope.room != room.as_str() {
            warn!(channel = %channel, room = %envelope.room, "Envelope room differs from channel");
        }

        let sender = envelope.sender.take().map(ConnectionId::from);
        let except = if self.config.echo_to_sender {
            None
        } else {
            sender.as_ref()
        };

        let delivered = self
            .transport
            .emit_to_group(room, ServerEvent::Message(envelope), except);
        trace!(room = %room, recipients = delivered, "Fanned out message");
        Ok(delivered)
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.connections.len(),
            rooms: self.subscriptions.snapshot().await,
        }
    }

    async fn leave_room(&self, id: &ConnectionId, room: &RoomId) -> Result<(), RelayError> {
        self.transport.leave_group(id, room);
        self.connections.set_room(id, None)?;
        self.release(room).await;

        debug!(connection = %id, room = %room, "Left room");
        Ok(())
    }

    async fn acquire(&self, room: &RoomId) {
        // The guard stays held across the upstream call so a room's
        // subscribe/unsubscribe reach the backbone in count order.
        let Some(mut state) = self.subscriptions.lock(room.as_str()).await else {
            return;
        };
        if !state.join().subscribed_now {
            return;
        }

        match self.backbone.subscribe(room.as_str()).await {
            Ok(()) => info!(room = %room, members = state.members(), "Subscribed upstream"),
            Err(e) => warn!(room = %room, error = %e, "Upstream subscribe failed"),
        }
    }

    async fn release(&self, room: &RoomId) {
        let Some(mut state) = self.subscriptions.lock(room.as_str()).await else {
            return;
        };
        if !state.leave().unsubscribed_now {
            return;
        }

        match self.backbone.unsubscribe(room.as_str()).await {
            Ok(()) => info!(room = %room, "Unsubscribed upstream"),
            Err(e) => warn!(room = %room, error = %e, "Upstream unsubscribe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::MemoryBroker;
    use async_trait::async_trait;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Publish(String, String),
        Subscribe(String),
        Unsubscribe(String),
    }

    #[derive(Default)]
    struct RecordingBackbone {
        calls: Mutex<Vec<Call>>,
        upstream: Mutex<HashSet<String>>,
        failing: AtomicBool,
    }

    impl RecordingBackbone {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &Call) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        fn is_upstream(&self, channel: &str) -> bool {
            self.upstream.lock().unwrap().contains(channel)
        }

        fn record(&self, call: Call) -> Result<(), BackboneError> {
            self.calls.lock().unwrap().push(call);
            if self.failing.load(Ordering::SeqCst) {
                Err(BackboneError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Backbone for RecordingBackbone {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackboneError> {
            self.record(Call::Publish(channel.into(), payload.into()))
        }

        async fn subscribe(&self, channel: &str) -> Result<(), BackboneError> {
            self.upstream.lock().unwrap().insert(channel.into());
            self.record(Call::Subscribe(channel.into()))
        }

        async fn unsubscribe(&self, channel: &str) -> Result<(), BackboneError> {
            self.upstream.lock().unwrap().remove(channel);
            self.record(Call::Unsubscribe(channel.into()))
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        groups: Mutex<HashMap<RoomId, HashSet<ConnectionId>>>,
        delivered: Mutex<Vec<(ConnectionId, ServerEvent)>>,
    }

    impl RecordingTransport {
        fn delivered_to(&self, id: &ConnectionId) -> Vec<ServerEvent> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to == id)
                .map(|(_, event)| event.clone())
                .collect()
        }

        fn groups_of(&self, id: &ConnectionId) -> Vec<RoomId> {
            self.groups
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, members)| members.contains(id))
                .map(|(room, _)| room.clone())
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn join_group(&self, connection: &ConnectionId, room: &RoomId) {
            self.groups
                .lock()
                .unwrap()
                .entry(room.clone())
                .or_default()
                .insert(connection.clone());
        }

        fn leave_group(&self, connection: &ConnectionId, room: &RoomId) {
            if let Some(members) = self.groups.lock().unwrap().get_mut(room) {
                members.remove(connection);
            }
        }

        fn emit_to_group(
            &self,
            room: &RoomId,
            event: ServerEvent,
            except: Option<&ConnectionId>,
        ) -> usize {
            let members: Vec<ConnectionId> = self
                .groups
                .lock()
                .unwrap()
                .get(room)
                .map(|m| m.iter().filter(|id| Some(*id) != except).cloned().collect())
                .unwrap_or_default();

            let mut delivered = self.delivered.lock().unwrap();
            for member in &members {
                delivered.push((member.clone(), event.clone()));
            }
            members.len()
        }

        fn emit_to(&self, connection: &ConnectionId, event: ServerEvent) -> bool {
            self.delivered
                .lock()
                .unwrap()
                .push((connection.clone(), event));
            true
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct Fixture {
        relay: Relay,
        transport: Arc<RecordingTransport>,
        backbone: Arc<RecordingBackbone>,
    }

    fn fixture_with(config: RelayConfig) -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let backbone = Arc::new(RecordingBackbone::default());
        let relay = Relay::with_config(
            RoomRegistry::default(),
            transport.clone(),
            backbone.clone(),
            config,
        );
        Fixture {
            relay,
            transport,
            backbone,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RelayConfig::default())
    }

    fn connect(relay: &Relay, name: &str) -> ConnectionId {
        let id = ConnectionId::from(name);
        relay.connect(&id).unwrap();
        id
    }

    #[tokio::test]
    async fn test_connect_greets_with_color() {
        let f = fixture();
        let a = ConnectionId::from("a");

        let color = f.relay.connect(&a).unwrap();

        assert_eq!(
            f.transport.delivered_to(&a),
            vec![ServerEvent::connected("a", color.to_string())]
        );
        assert!(matches!(
            f.relay.connect(&a),
            Err(RelayError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_first_join_subscribes_upstream() {
        let f = fixture();
        let a = connect(&f.relay, "a");

        f.relay.join(&a, "ANXIETY").await.unwrap();

        assert_eq!(f.relay.subscriptions().member_count("ANXIETY").await, 1);
        assert_eq!(f.backbone.calls(), vec![Call::Subscribe("ANXIETY".into())]);
        let anxiety = f.relay.registry().get("ANXIETY").cloned().unwrap();
        assert_eq!(f.transport.groups_of(&a), vec![anxiety]);
    }

    #[tokio::test]
    async fn test_last_leave_unsubscribes_upstream() {
        let f = fixture();
        let a = connect(&f.relay, "a");
        let b = connect(&f.relay, "b");

        f.relay.join(&a, "OCD").await.unwrap();
        f.relay.join(&b, "OCD").await.unwrap();
        assert_eq!(f.backbone.count(&Call::Subscribe("OCD".into())), 1);

        f.relay.leave(&a).await.unwrap();
        assert_eq!(f.relay.subscriptions().member_count("OCD").await, 1);
        assert_eq!(f.backbone.count(&Call::Unsubscribe("OCD".into())), 0);

        f.relay.leave(&b).await.unwrap();
        assert_eq!(f.relay.subscriptions().member_count("OCD").await, 0);
        assert_eq!(f.backbone.count(&Call::Unsubscribe("OCD".into())), 1);
    }

    #[tokio::test]
    async fn test_send_publishes_and_fans_out() {
        let f = fixture();
        let a = connect(&f.relay, "a");
        let b = connect(&f.relay, "b");
        let c = connect(&f.relay, "c");
        f.relay.join(&a, "DEPRESSION").await.unwrap();
        f.relay.join(&b, "DEPRESSION").await.unwrap();
        f.relay.join(&c, "OCD").await.unwrap();

        f.relay.send(&a, "hi").await.unwrap();

        let color = f.relay.connections().color_of(&a).unwrap().to_string();
        let published = f
            .backbone
            .calls()
            .into_iter()
            .find_map(|call| match call {
                Call::Publish(channel, payload) => Some((channel, payload)),
                _ => None,
            })
            .unwrap();
        assert_eq!(published.0, "DEPRESSION");
        let value: serde_json::Value = serde_json::from_str(&published.1).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"room": "DEPRESSION", "message": "hi", "color": color})
        );

        let delivered = f
            .relay
            .on_backbone_message("DEPRESSION", &published.1)
            .unwrap();
        assert_eq!(delivered, 2);

        let expected = ServerEvent::Message(Envelope::new("DEPRESSION", "hi", color));
        assert!(f.transport.delivered_to(&a).contains(&expected));
        assert!(f.transport.delivered_to(&b).contains(&expected));
        assert!(!f.transport.delivered_to(&c).contains(&expected));
    }

    #[tokio::test]
    async fn test_join_other_room_switches() {
        let f = fixture();
        let a = connect(&f.relay, "a");

        f.relay.join(&a, "ADHD").await.unwrap();
        f.relay.join(&a, "OCD").await.unwrap();

        assert_eq!(f.relay.subscriptions().member_count("ADHD").await, 0);
        assert_eq!(f.relay.subscriptions().member_count("OCD").await, 1);
        assert_eq!(
            f.relay.connections().current_room(&a).map(|r| r.to_string()),
            Some("OCD".to_string())
        );
        assert_eq!(
            f.backbone.calls(),
            vec![
                Call::Subscribe("ADHD".into()),
                Call::Unsubscribe("ADHD".into()),
                Call::Subscribe("OCD".into()),
            ]
        );
        assert_eq!(f.transport.groups_of(&a).len(), 1);
    }

    #[tokio::test]
    async fn test_join_invalid_room_changes_nothing() {
        let f = fixture();
        let a = connect(&f.relay, "a");

        let result = f.relay.join(&a, "PTSD").await;

        assert!(matches!(result, Err(RelayError::InvalidRoom(room)) if room == "PTSD"));
        assert!(f.backbone.calls().is_empty());
        assert_eq!(f.relay.connections().current_room(&a), None);
        assert!(f.transport.groups_of(&a).is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_same_room_is_idempotent() {
        let f = fixture();
        let a = connect(&f.relay, "a");

        f.relay.join(&a, "OCD").await.unwrap();
        f.relay.join(&a, "OCD").await.unwrap();

        assert_eq!(f.relay.subscriptions().member_count("OCD").await, 1);
        assert_eq!(f.backbone.calls(), vec![Call::Subscribe("OCD".into())]);
    }

    #[tokio::test]
    async fn test_disconnect_releases_room_and_record() {
        let f = fixture();
        let a = connect(&f.relay, "a");
        let b = connect(&f.relay, "b");
        f.relay.join(&a, "ANXIETY").await.unwrap();
        f.relay.join(&b, "ANXIETY").await.unwrap();

        assert!(f.relay.disconnect(&a).await);

        assert_eq!(f.relay.subscriptions().member_count("ANXIETY").await, 1);
        assert!(!f.relay.connections().contains(&a));
        assert!(f.transport.groups_of(&a).is_empty());
        assert!(!f.relay.disconnect(&a).await);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_noop() {
        let f = fixture();
        let ghost = ConnectionId::from("ghost");

        assert!(matches!(
            f.relay.join(&ghost, "OCD").await,
            Err(RelayError::UnknownConnection(_))
        ));
        assert!(matches!(
            f.relay.send(&ghost, "boo").await,
            Err(RelayError::UnknownConnection(_))
        ));
        assert!(!f.relay.disconnect(&ghost).await);
        assert_eq!(f.relay.subscriptions().member_count("OCD").await, 0);
        assert!(f.backbone.calls().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_leave_without_room() {
        let f = fixture();
        let a = connect(&f.relay, "a");

        assert!(matches!(
            f.relay.send(&a, "hello?").await,
            Err(RelayError::NotInRoom(_))
        ));
        assert!(matches!(
            f.relay.leave(&a).await,
            Err(RelayError::NotInRoom(_))
        ));
        assert!(f.backbone.calls().is_empty());
    }

    #[tokio::test]
    async fn test_backbone_failure_keeps_counts() {
        let f = fixture();
        let a = connect(&f.relay, "a");
        f.backbone.failing.store(true, Ordering::SeqCst);

        f.relay.join(&a, "OCD").await.unwrap();
        assert_eq!(f.relay.subscriptions().member_count("OCD").await, 1);
        assert!(f.relay.subscriptions().is_subscribed("OCD").await);

        assert!(matches!(
            f.relay.send(&a, "lost").await,
            Err(RelayError::Backbone(_))
        ));

        f.relay.leave(&a).await.unwrap();
        assert_eq!(f.relay.subscriptions().member_count("OCD").await, 0);
        assert!(!f.relay.subscriptions().is_subscribed("OCD").await);
    }

    #[tokio::test]
    async fn test_echo_can_be_disabled() {
        let f = fixture_with(RelayConfig {
            echo_to_sender: false,
        });
        let a = connect(&f.relay, "a");
        let b = connect(&f.relay, "b");
        f.relay.join(&a, "OCD").await.unwrap();
        f.relay.join(&b, "OCD").await.unwrap();

        f.relay.send(&a, "no echo").await.unwrap();
        let payload = f
            .backbone
            .calls()
            .into_iter()
            .find_map(|call| match call {
                Call::Publish(_, payload) => Some(payload),
                _ => None,
            })
            .unwrap();

        assert_eq!(f.relay.on_backbone_message("OCD", &payload).unwrap(), 1);

        let to_b = f.transport.delivered_to(&b);
        match to_b.last() {
            Some(ServerEvent::Message(envelope)) => {
                assert_eq!(envelope.body, "no echo");
                assert!(envelope.sender.is_none());
            }
            other => panic!("Expected message, got {:?}", other),
        }
        assert!(!f
            .transport
            .delivered_to(&a)
            .iter()
            .any(|event| matches!(event, ServerEvent::Message(_))));
    }

    #[tokio::test]
    async fn test_inbound_on_unknown_channel_ignored() {
        let f = fixture();
        let a = connect(&f.relay, "a");
        f.relay.join(&a, "OCD").await.unwrap();

        let payload = Envelope::new("PTSD", "x", "rgb(0,0,0)").to_payload().unwrap();
        assert_eq!(f.relay.on_backbone_message("PTSD", &payload).unwrap(), 0);
        assert!(matches!(
            f.relay.on_backbone_message("OCD", "{not json"),
            Err(RelayError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_dispatches_client_events() {
        let f = fixture();
        let a = connect(&f.relay, "a");

        f.relay.handle(&a, ClientEvent::join_room("ADHD")).await;
        f.relay.handle(&a, ClientEvent::message("hey")).await;
        f.relay.handle(&a, ClientEvent::join_room("PTSD")).await;
        let room = f.relay.connections().current_room(&a);
        assert_eq!(room.as_ref().map(RoomId::as_str), Some("ADHD"));

        f.relay.handle(&a, ClientEvent::LeaveRoom).await;
        f.relay.handle(&a, ClientEvent::LeaveRoom).await;

        assert_eq!(
            f.backbone.calls().len(),
            3,
            "subscribe, publish, unsubscribe: {:?}",
            f.backbone.calls()
        );
        let stats = f.relay.stats().await;
        assert_eq!(stats.connections, 1);
        assert!(stats.rooms.iter().all(|r| r.members == 0 && !r.subscribed));
    }

    #[tokio::test]
    async fn test_two_instances_share_memory_backbone() {
        let broker = MemoryBroker::new();
        let (backbone1, mut inbound1) = broker.connect();
        let (backbone2, mut inbound2) = broker.connect();
        let transport1 = Arc::new(RecordingTransport::default());
        let transport2 = Arc::new(RecordingTransport::default());
        let relay1 = Relay::new(RoomRegistry::default(), transport1.clone(), Arc::new(backbone1));
        let relay2 = Relay::new(RoomRegistry::default(), transport2.clone(), Arc::new(backbone2));

        let a = connect(&relay1, "a");
        let b = connect(&relay2, "b");
        relay1.join(&a, "OCD").await.unwrap();
        relay2.join(&b, "OCD").await.unwrap();
        assert_eq!(broker.subscriber_count("OCD"), 2);

        relay1.send(&a, "across").await.unwrap();

        let message = inbound2.try_recv().unwrap();
        assert_eq!(relay2.on_backbone_message(&message.channel, &message.payload).unwrap(), 1);
        let echoed = inbound1.try_recv().unwrap();
        assert_eq!(relay1.on_backbone_message(&echoed.channel, &echoed.payload).unwrap(), 1);

        assert!(transport2
            .delivered_to(&b)
            .iter()
            .any(|event| matches!(event, ServerEvent::Message(e) if e.body == "across")));

        relay2.disconnect(&b).await;
        assert_eq!(broker.subscriber_count("OCD"), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect(usize),
        Join(usize, usize),
        Leave(usize),
        Send(usize),
        Disconnect(usize),
    }

    const CONNECTIONS: usize = 4;
    const ROOM_CHOICES: [&str; 5] = ["ADHD", "OCD", "DEPRESSION", "ANXIETY", "PTSD"];

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..CONNECTIONS).prop_map(Op::Connect),
            (0..CONNECTIONS, 0..ROOM_CHOICES.len()).prop_map(|(c, r)| Op::Join(c, r)),
            (0..CONNECTIONS).prop_map(Op::Leave),
            (0..CONNECTIONS).prop_map(Op::Send),
            (0..CONNECTIONS).prop_map(Op::Disconnect),
        ]
    }

    async fn check_invariants(f: &Fixture, ids: &[ConnectionId]) {
        for room in f.relay.registry().rooms() {
            let count = f.relay.subscriptions().member_count(room.as_str()).await;
            let subscribed = f.relay.subscriptions().is_subscribed(room.as_str()).await;

            assert_eq!(count > 0, subscribed, "flag out of sync for {room}");
            let upstream = f.backbone.is_upstream(room.as_str());
            assert_eq!(subscribed, upstream, "upstream out of sync for {room}");
            assert_eq!(count, f.relay.connections().members_of(room.as_str()));
        }

        for id in ids {
            let groups = f.transport.groups_of(id);
            assert!(groups.len() <= 1, "{id} is in {} groups", groups.len());
            assert_eq!(groups.first().cloned(), f.relay.connections().current_room(id));
        }
    }

    proptest! {
        #[test]
        fn prop_upstream_tracks_member_count(ops in vec(op_strategy(), 1..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let f = fixture();
                let ids: Vec<ConnectionId> = (0..CONNECTIONS)
                    .map(|i| ConnectionId::new(format!("conn-{i}")))
                    .collect();
                for id in &ids {
                    f.relay.connect(id).unwrap();
                }

                for op in ops {
                    match op {
                        Op::Connect(c) => {
                            let _ = f.relay.connect(&ids[c]);
                        }
                        Op::Join(c, r) => {
                            let _ = f.relay.join(&ids[c], ROOM_CHOICES[r]).await;
                        }
                        Op::Leave(c) => {
                            let _ = f.relay.leave(&ids[c]).await;
                        }
                        Op::Send(c) => {
                            let _ = f.relay.send(&ids[c], "x").await;
                        }
                        Op::Disconnect(c) => {
                            f.relay.disconnect(&ids[c]).await;
                        }
                    }
                    check_invariants(&f, &ids).await;
                }
            });
        }
    }
}
