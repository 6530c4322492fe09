//! # parlor-protocol
//!
//! Wire definitions for the Parlor room relay.
//!
//! This crate defines the events exchanged between clients and a relay
//! instance, the message envelope that travels over the pub/sub backbone,
//! and the codecs used to put both on the wire.
//!
//! ## Events
//!
//! - `joinRoom` / `leaveRoom` - Room membership
//! - `event:message` - Send text into the current room
//! - `connected` / `message` - Server to client notifications
//!
//! ## Example
//!
//! ```rust
//! use parlor_protocol::{codec, ClientEvent};
//!
//! let event: ClientEvent = codec::decode_json(r#"{"event":"joinRoom","data":{"room":"OCD"}}"#).unwrap();
//! assert_eq!(event, ClientEvent::join_room("OCD"));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError, WireFormat};
pub use events::{ClientEvent, Envelope, ServerEvent};
