//! Connection handlers for the Parlor server.
//!
//! This module wires the WebSocket endpoint, the broadcast groups and the
//! backbone into a running relay.

use crate::backbone::{self, Inbound};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parlor_core::{ConnectionId, Relay};
use parlor_protocol::{codec, ClientEvent, ServerEvent, WireFormat};
use parlor_transport::BroadcastGroups;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay.
    pub relay: Arc<Relay>,
    /// Local fan-out groups, also the relay's transport.
    pub groups: Arc<BroadcastGroups>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Build the relay for `config` on top of a connected backbone.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured rooms are invalid or the backbone
    /// cannot be reached.
    pub async fn connect(config: Config) -> Result<(Self, Inbound)> {
        let registry = config.registry().context("Invalid room configuration")?;
        let groups = Arc::new(BroadcastGroups::new());
        let (backbone, inbound) = backbone::connect(&config.backbone.url).await?;

        let relay = Arc::new(Relay::with_config(
            registry,
            groups.clone(),
            backbone,
            config.relay_config(),
        ));

        Ok((
            Self {
                relay,
                groups,
                config,
            },
            inbound,
        ))
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parlor server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, config).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the relay cannot be built or the server fails.
pub async fn serve(listener: TcpListener, config: Config) -> Result<()> {
    let (state, inbound) = AppState::connect(config).await?;
    serve_state(listener, Arc::new(state), inbound).await
}

async fn serve_state(listener: TcpListener, state: Arc<AppState>, inbound: Inbound) -> Result<()> {
    let pump = spawn_backbone_pump(state.relay.clone(), inbound);
    let app = build_app(state);

    let result = axum::serve(listener, app).await;
    pump.abort();
    result?;

    Ok(())
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.transport.allowed_origins);

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Deliver backbone messages to the relay until the backbone closes.
fn spawn_backbone_pump(relay: Arc<Relay>, mut inbound: Inbound) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            match relay.on_backbone_message(&msg.channel, &msg.payload) {
                Ok(recipients) => {
                    metrics::record_message(msg.payload.len(), "backbone");
                    debug!(channel = %msg.channel, recipients, "Backbone message delivered");
                }
                Err(e) => {
                    warn!(channel = %msg.channel, error = %e, "Dropping backbone message");
                    metrics::record_error("backbone_payload");
                }
            }
        }
        warn!("Backbone inbound stream closed");
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.groups.connection_count(),
    }))
}

/// One room as reported by `/rooms`.
#[derive(Debug, Serialize)]
struct RoomView {
    room: String,
    /// Connections counted by the subscription manager.
    members: usize,
    /// Connections in the room's broadcast group.
    listeners: usize,
    subscribed: bool,
}

/// Per-room membership and upstream subscription state.
async fn rooms_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rooms: Vec<RoomView> = state
        .relay
        .subscriptions()
        .snapshot()
        .await
        .into_iter()
        .map(|snapshot| RoomView {
            listeners: state.groups.group_size(snapshot.room.as_str()),
            room: snapshot.room,
            members: snapshot.members,
            subscribed: snapshot.subscribed,
        })
        .collect();

    axum::Json(serde_json::json!({
        "connections": state.relay.connections().len(),
        "rooms": rooms,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());

    if !state.config.transport.origin_allowed(origin) {
        warn!(origin = ?origin, "Rejected WebSocket from disallowed origin");
        metrics::record_error("origin");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();

    // The queue must exist before the relay greets the connection.
    let mut outbound = state.groups.register(&connection_id);
    if let Err(e) = state.relay.connect(&connection_id) {
        error!(connection = %connection_id, error = %e, "Failed to register connection");
        state.groups.unregister(&connection_id);
        return;
    }

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies follow the format the client last wrote in.
    let mut format = WireFormat::default();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(event) = outbound.recv() => {
                if let Err(e) = send_event(&mut sender, &event, format).await {
                    debug!(connection = %connection_id, error = %e, "Outbound send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        format = WireFormat::Text;
                        metrics::record_message(text.len(), "inbound");

                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => handle_event(&state, &connection_id, event).await,
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Malformed event");
                                metrics::record_error("decode");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        format = WireFormat::Binary;
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        handle_frames(&state, &connection_id, &mut read_buffer).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.relay.disconnect(&connection_id).await;
    state.groups.unregister(&connection_id);
    metrics::set_subscribed_rooms(state.relay.subscriptions().subscribed_count().await);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

async fn handle_event(state: &AppState, connection_id: &ConnectionId, event: ClientEvent) {
    let membership_change = !matches!(event, ClientEvent::Message { .. });

    state.relay.handle(connection_id, event).await;

    if membership_change {
        metrics::set_subscribed_rooms(state.relay.subscriptions().subscribed_count().await);
    }
}

/// Handle every complete binary frame in the buffer.
///
/// A frame that fails to decode discards the rest of the buffer.
async fn handle_frames(state: &AppState, connection_id: &ConnectionId, buf: &mut BytesMut) {
    loop {
        match codec::decode_from::<ClientEvent>(buf) {
            Ok(Some(event)) => handle_event(state, connection_id, event).await,
            Ok(None) => break,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Malformed frame");
                metrics::record_error("decode");
                buf.clear();
                break;
            }
        }
    }
}

/// Send a server event in the connection's wire format.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    format: WireFormat,
) -> Result<()> {
    let message = match format {
        WireFormat::Text => Message::Text(codec::encode_json(event)?),
        WireFormat::Binary => Message::Binary(codec::encode(event)?.to_vec()),
    };

    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_message(len, "outbound");

    sender.send(message).await?;
    Ok(())
}
