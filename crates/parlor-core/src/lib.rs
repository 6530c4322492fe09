//! # parlor-core
//!
//! Room membership and fan-out core for the Parlor relay.
//!
//! This crate provides the building blocks a relay instance is made of:
//!
//! - **RoomRegistry** - The closed set of valid rooms
//! - **ConnectionState** - Per-connection room and display color
//! - **SubscriptionManager** - Reference-counted upstream subscriptions
//! - **Relay** - Wires connection events to state changes and the backbone
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────────┐
//! │  Transport  │────▶│    Relay    │────▶│  SubscriptionManager │
//! └─────────────┘     └─────────────┘     └──────────────────────┘
//!        ▲                   │                       │
//!        │                   ▼                       ▼
//!        │            ┌─────────────┐         ┌─────────────┐
//!        └────────────│ Connections │         │  Backbone   │
//!          fan-out    └─────────────┘         └─────────────┘
//! ```

pub mod backbone;
pub mod connection;
pub mod registry;
pub mod relay;
pub mod subscription;
pub mod transport;

pub use backbone::{Backbone, BackboneError, BackboneMessage, MemoryBackbone, MemoryBroker};
pub use connection::{Color, ConnectionError, ConnectionId, ConnectionRecord, ConnectionState};
pub use registry::{RegistryError, RoomId, RoomRegistry, DEFAULT_ROOMS};
pub use relay::{Relay, RelayConfig, RelayError, RelayStats};
pub use subscription::{
    JoinOutcome, LeaveOutcome, RoomSnapshot, RoomSubscription, SubscriptionManager,
};
pub use transport::Transport;
