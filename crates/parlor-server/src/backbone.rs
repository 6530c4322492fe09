//! Backbone adapters selected by URL.
//!
//! `redis://` and `rediss://` URLs use Redis pub/sub; `memory://` uses an
//! in-process broker, which only fans out within this process.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parlor_core::{Backbone, BackboneError, BackboneMessage, MemoryBroker};
use redis::aio::{ConnectionManager, PubSub, PubSubSink};
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Inbound side of a backbone.
pub type Inbound = mpsc::UnboundedReceiver<BackboneMessage>;

/// Connect to the backbone named by `url`.
///
/// # Errors
///
/// Returns an error for unsupported schemes or if Redis cannot be reached.
pub async fn connect(url: &str) -> Result<(Arc<dyn Backbone>, Inbound)> {
    if url.starts_with("memory://") {
        let (backbone, inbound) = MemoryBroker::new().connect();
        info!("Using in-process memory backbone");
        return Ok((Arc::new(backbone), inbound));
    }

    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let (backbone, inbound) = RedisBackbone::connect(url).await?;
        return Ok((Arc::new(backbone), inbound));
    }

    bail!("Unsupported backbone URL: {url}")
}

type Reply = oneshot::Sender<Result<(), BackboneError>>;

/// Requests to the subscriber task.
#[derive(Debug)]
enum Command {
    Subscribe(String, Reply),
    Unsubscribe(String, Reply),
}

impl Command {
    /// Apply the command to the set of channels that should be held.
    fn record(&self, channels: &mut HashSet<String>) {
        match self {
            Command::Subscribe(channel, _) => {
                channels.insert(channel.clone());
            }
            Command::Unsubscribe(channel, _) => {
                channels.remove(channel);
            }
        }
    }

    fn reply(self, result: Result<(), BackboneError>) {
        let (Command::Subscribe(_, reply) | Command::Unsubscribe(_, reply)) = self;
        let _ = reply.send(result);
    }
}

/// Redis pub/sub backbone.
///
/// Publishing goes through a reconnecting multiplexed connection. Subscribe
/// and unsubscribe are queued, in call order, to a task that owns the
/// dedicated pub/sub connection. That task remembers which channels should
/// be held and subscribes them again after a reconnect.
pub struct RedisBackbone {
    publisher: ConnectionManager,
    commands: mpsc::UnboundedSender<Command>,
}

impl RedisBackbone {
    /// Connect to Redis and start the subscriber task.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the publish connection
    /// cannot be established.
    pub async fn connect(url: &str) -> Result<(Self, Inbound)> {
        let client = RedisClient::open(url).context("Failed to create Redis client")?;

        let publisher = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            ConnectionManager::new(client.clone()),
        )
        .await
        .context("Timed out connecting to Redis")?
        .context("Failed to connect to Redis")?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriber(client, command_rx, inbound_tx));

        info!("Connected to Redis backbone");
        Ok((
            Self {
                publisher,
                commands,
            },
            inbound,
        ))
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), BackboneError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| BackboneError::Closed)?;
        response.await.map_err(|_| BackboneError::Closed)?
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackboneError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(channel, payload),
        )
        .await
        .map_err(|_| BackboneError::Unavailable("publish timed out".into()))?
        .map_err(|e| BackboneError::Unavailable(e.to_string()))?;

        debug!(channel = %channel, receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BackboneError> {
        let channel = channel.to_string();
        self.request(|reply| Command::Subscribe(channel, reply)).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackboneError> {
        let channel = channel.to_string();
        self.request(|reply| Command::Unsubscribe(channel, reply)).await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Own the pub/sub connection: apply commands, forward messages, reconnect.
///
/// Exits once the backbone handle is dropped.
async fn run_subscriber(
    client: RedisClient,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<BackboneMessage>,
) {
    let mut channels: HashSet<String> = HashSet::new();
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        match open_pubsub(&client, &channels).await {
            Ok(pubsub) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                let (mut sink, mut stream) = pubsub.split();
                info!(channels = channels.len(), "Redis subscriber connected");

                loop {
                    tokio::select! {
                        command = commands.recv() => {
                            let Some(command) = command else {
                                info!("Redis backbone dropped, subscriber exiting");
                                return;
                            };
                            apply(&mut sink, &mut channels, command).await;
                        }
                        msg = stream.next() => {
                            let Some(msg) = msg else {
                                break;
                            };
                            if !forward(&inbound, &msg) {
                                info!("Backbone inbound receiver dropped, subscriber exiting");
                                return;
                            }
                        }
                    }
                }

                warn!(
                    "Redis subscriber connection lost, reconnecting after {}s",
                    backoff_secs
                );
            }
            Err(e) => {
                warn!(error = %e, "Redis subscriber failed to connect, retrying after backoff");
            }
        }

        // Keep accepting commands while disconnected; they are applied on reconnect.
        let delay = sleep(Duration::from_secs(backoff_secs));
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                command = commands.recv() => {
                    let Some(command) = command else {
                        return;
                    };
                    defer(command, &mut channels);
                }
            }
        }
        backoff_secs = next_backoff(backoff_secs);
    }
}

/// Delay before the next reconnect attempt: doubles, capped at 30 seconds.
fn next_backoff(secs: u64) -> u64 {
    (secs * 2).min(MAX_BACKOFF_SECS)
}

/// Take a command while disconnected.
///
/// The channel set is updated so the reconnect applies it, but the caller
/// is told the backbone is unavailable.
fn defer(command: Command, channels: &mut HashSet<String>) {
    command.record(channels);
    command.reply(Err(BackboneError::Unavailable(
        "Redis subscriber reconnecting".into(),
    )));
}

/// Hand a pub/sub message to the relay. Returns `false` once nobody listens.
fn forward(inbound: &mpsc::UnboundedSender<BackboneMessage>, msg: &redis::Msg) -> bool {
    let channel = msg.get_channel_name().to_string();
    match msg.get_payload::<String>() {
        Ok(payload) => inbound.send(BackboneMessage::new(channel, payload)).is_ok(),
        Err(e) => {
            warn!(error = %e, channel = %channel, "Invalid payload");
            true
        }
    }
}

/// Open a pub/sub connection and subscribe every channel that should be held.
async fn open_pubsub(client: &RedisClient, channels: &HashSet<String>) -> Result<PubSub> {
    let mut pubsub = timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        client.get_async_pubsub(),
    )
    .await
    .context("Timed out getting Redis Pub/Sub connection")?
    .context("Failed to get Redis Pub/Sub connection")?;

    for channel in channels {
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("Failed to resubscribe to {channel}"))?;
    }

    Ok(pubsub)
}

async fn apply(sink: &mut PubSubSink, channels: &mut HashSet<String>, command: Command) {
    command.record(channels);

    let result = match &command {
        Command::Subscribe(channel, _) => sink.subscribe(channel).await,
        Command::Unsubscribe(channel, _) => sink.unsubscribe(channel).await,
    };

    command.reply(result.map_err(|e| BackboneError::Unavailable(e.to_string())));
}
