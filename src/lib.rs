//! Signaling for live peer-to-peer audio broadcasts
//!
//! A broadcaster registers a named broadcast with the signaling server;
//! listeners watch the directory of live broadcasts and join one. The server
//! pairs each listener with the broadcaster and relays the offer, answer and
//! candidates between them. Audio then flows directly between the two peers;
//! the server never touches media.
//!
//! ```text
//!  [Broadcaster]                 [Signaling server]                 [Listener]
//!       │ broadcast-start ──────────►  Directory                         │
//!       │                              │ broadcast-list ───────────────► │
//!       │                              │ ◄──────────── connect-request   │
//!       │ ◄────────── listener-joined  Router  connect-accepted ───────► │
//!       │ offer ───────────────────────┼─────────────────────────────► │
//!       │ ◄────────────────────────────┼──────────────────────── answer  │
//!       │ candidate ◄──────────────────┼──────────────────► candidate    │
//!       │                                                                │
//!       └═════════════════════ audio (peer to peer) ═════════════════════┘
//! ```
//!
//! # Modules
//!
//! - [`protocol`]: wire messages and the websocket frame codec
//! - [`directory`]: registry of live broadcasts
//! - [`router`]: pairings and negotiation message relay
//! - [`session`]: per-pairing negotiation state machine
//! - [`server`]: websocket server and the hub event loop
//! - [`client`]: reconnecting signaling channel and the peer orchestrator
//! - [`stats`]: server statistics

pub mod client;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod stats;

pub use client::{ClientConfig, Peer, PeerCommand, PeerEvent, SignalingChannel};
pub use error::{Error, Result};
pub use protocol::{BroadcastId, BroadcastSummary, ErrorCode, Message, PairingId};
pub use server::{ServerConfig, SignalingServer};
pub use session::{MediaFactory, MediaTransport, NegotiationSession};
pub use stats::ServerStats;
