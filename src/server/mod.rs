//! Signaling server
//!
//! Accepts websocket connections and runs the hub that owns the broadcast
//! directory and the session router.

pub mod config;
pub mod connection;
pub mod hub;
pub mod listener;

pub use config::ServerConfig;
pub use hub::{outbound, ConnectionRole, Hub, HubEvent, Inbox, Outbound};
pub use listener::SignalingServer;
