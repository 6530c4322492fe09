//! # parlor-transport
//!
//! Transport adapter for the Parlor relay.
//!
//! Live connections register an outbound queue here. The relay then drives
//! per-room broadcast groups through the [`Transport`] trait, and each
//! connection task drains its own queue onto the socket.
//!
//! ```rust,ignore
//! use parlor_transport::BroadcastGroups;
//!
//! let groups = BroadcastGroups::new();
//! let mut outbound = groups.register(&connection_id);
//! while let Some(event) = outbound.recv().await {
//!     // Write event to the socket
//! }
//! ```
//!
//! [`Transport`]: parlor_core::Transport

pub mod groups;

pub use groups::{BroadcastGroups, Outbound};
