//! Signaling client
//!
//! Provides the client side of the signaling protocol for:
//! - Broadcasting: register a broadcast and offer audio to every listener
//! - Listening: follow the directory and join broadcasts
//!
//! The [`SignalingChannel`] keeps the websocket alive across drops; the
//! [`Peer`] runs the negotiations; [`spawn`] wires both into one task.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod driver;
pub mod peer;

pub use backoff::Backoff;
pub use channel::{ChannelEvent, ChannelState, SignalingChannel};
pub use config::ClientConfig;
pub use driver::{drive, spawn, ClientHandle};
pub use peer::{Peer, PeerCommand, PeerError, PeerEvent, PeerMode};
