//! The pub/sub backbone shared by relay instances.
//!
//! A backbone exposes `publish`, `subscribe` and `unsubscribe` over named
//! channels and delivers every message published on a channel to all
//! instances subscribed to it. Channel names are room identifiers.
//!
//! Inbound messages are not part of the trait: each implementation hands
//! out a receiver of [`BackboneMessage`] when it is created.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Backbone errors.
#[derive(Debug, Error)]
pub enum BackboneError {
    /// The broker could not be reached or rejected the call.
    #[error("Backbone unavailable: {0}")]
    Unavailable(String),

    /// The backbone has been shut down.
    #[error("Backbone closed")]
    Closed,
}

/// A message delivered by the backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Serialized envelope.
    pub payload: String,
}

impl BackboneMessage {
    /// Create a new backbone message.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe operations against the backbone.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackboneError>;

    /// Start receiving messages published on a channel.
    async fn subscribe(&self, channel: &str) -> Result<(), BackboneError>;

    /// Stop receiving messages published on a channel.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BackboneError>;

    /// Backbone name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;
}

type Subscribers = HashMap<u64, mpsc::UnboundedSender<BackboneMessage>>;

/// In-process broker that several relay instances can share.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    channels: Arc<DashMap<String, Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new instance to the broker.
    ///
    /// Returns the backbone handle and the receiver of messages on the
    /// channels that handle subscribes to.
    #[must_use]
    pub fn connect(&self) -> (MemoryBackbone, mpsc::UnboundedReceiver<BackboneMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backbone = MemoryBackbone {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            broker: self.clone(),
            sender,
        };
        (backbone, receiver)
    }

    /// Number of instances subscribed to a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }
}

/// One instance's handle on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryBackbone {
    id: u64,
    broker: MemoryBroker,
    sender: mpsc::UnboundedSender<BackboneMessage>,
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackboneError> {
        let Some(mut subscribers) = self.broker.channels.get_mut(channel) else {
            trace!(channel = %channel, "Publish with no subscribers");
            return Ok(());
        };

        let message = BackboneMessage::new(channel, payload);
        subscribers.retain(|_, sender| sender.send(message.clone()).is_ok());
        trace!(channel = %channel, recipients = subscribers.len(), "Published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BackboneError> {
        if self.sender.is_closed() {
            return Err(BackboneError::Closed);
        }
        self.broker
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(self.id, self.sender.clone());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackboneError> {
        self.broker
            .channels
            .remove_if_mut(channel, |_, subscribers| {
                subscribers.remove(&self.id);
                subscribers.is_empty()
            });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl Drop for MemoryBackbone {
    fn drop(&mut self) {
        self.broker.channels.retain(|_, subscribers| {
            subscribers.remove(&self.id);
            !subscribers.is_empty()
        });
    }
}
