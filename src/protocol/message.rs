//! Signaling message envelope
//!
//! Every frame on the wire is one JSON object `{ "type": ..., ...fields }`.
//! The `type` tag is kebab-case and field names are camelCase. Negotiation
//! payloads (`sdp`, `candidate`) are opaque to the server and relayed as-is.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a broadcast in the directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(String);

impl BroadcastId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a broadcaster/listener pairing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingId(String);

impl PairingId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broadcast description sent with `broadcast-start`
///
/// Only `name` is authoritative. The server assigns the identifier and the
/// start time, so `id` and `startTime` are accepted but ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BroadcastId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
}

impl BroadcastInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            start_time: None,
        }
    }
}

/// One row of the directory snapshot pushed to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSummary {
    pub id: BroadcastId,
    pub name: String,
    pub listener_count: u32,
    /// Unix time in milliseconds
    pub start_time: u64,
}

impl BroadcastSummary {
    /// Time on air as of `now_ms` (Unix milliseconds)
    pub fn on_air(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.start_time))
    }
}

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidName,
    AlreadyBroadcasting,
    BroadcastNotFound,
    BroadcastFull,
    UnknownPairing,
    RoleConflict,
    MalformedMessage,
    NegotiationTimeout,
    TransportUnreachable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidName => "InvalidName",
            ErrorCode::AlreadyBroadcasting => "AlreadyBroadcasting",
            ErrorCode::BroadcastNotFound => "BroadcastNotFound",
            ErrorCode::BroadcastFull => "BroadcastFull",
            ErrorCode::UnknownPairing => "UnknownPairing",
            ErrorCode::RoleConflict => "RoleConflict",
            ErrorCode::MalformedMessage => "MalformedMessage",
            ErrorCode::NegotiationTimeout => "NegotiationTimeout",
            ErrorCode::TransportUnreachable => "TransportUnreachable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every message exchanged over a signaling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Client → server: register a broadcast
    BroadcastStart {
        #[serde(rename = "broadcastInfo")]
        broadcast_info: BroadcastInfo,
    },

    /// Client → server: stop the broadcast owned by this connection
    BroadcastEnd {
        #[serde(rename = "broadcastId")]
        broadcast_id: BroadcastId,
    },

    /// Server → broadcaster: registration accepted
    BroadcastStarted {
        #[serde(rename = "broadcastId")]
        broadcast_id: BroadcastId,
        #[serde(rename = "startTime")]
        start_time: u64,
    },

    /// Client → server: enter listener mode and receive directory pushes
    Listen,

    /// Server → listeners: directory snapshot
    BroadcastList { broadcasts: Vec<BroadcastSummary> },

    /// Listener → server: join a broadcast
    ConnectRequest {
        #[serde(rename = "broadcastId")]
        broadcast_id: BroadcastId,
    },

    /// Server → listener: the pairing created for a connect request
    ConnectAccepted {
        #[serde(rename = "pairingId")]
        pairing_id: PairingId,
        #[serde(rename = "broadcastId")]
        broadcast_id: BroadcastId,
    },

    /// Server → broadcaster: a listener joined, create an offer for it
    ListenerJoined {
        #[serde(rename = "pairingId")]
        pairing_id: PairingId,
        #[serde(rename = "broadcastId")]
        broadcast_id: BroadcastId,
    },

    Offer {
        #[serde(rename = "pairingId")]
        pairing_id: PairingId,
        sdp: String,
    },

    Answer {
        #[serde(rename = "pairingId")]
        pairing_id: PairingId,
        sdp: String,
    },

    Candidate {
        #[serde(rename = "pairingId")]
        pairing_id: PairingId,
        candidate: Value,
    },

    /// Client → server: tear down one pairing
    PairingEnd {
        #[serde(rename = "pairingId")]
        pairing_id: PairingId,
    },

    /// Server → client: a pairing was torn down
    PairingClosed {
        #[serde(rename = "pairingId")]
        pairing_id: PairingId,
    },

    /// Server → client: the originating action failed
    Error {
        code: ErrorCode,
        message: String,
        #[serde(
            rename = "pairingId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        pairing_id: Option<PairingId>,
    },
}

impl Message {
    /// The `type` tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Message::BroadcastStart { .. } => "broadcast-start",
            Message::BroadcastEnd { .. } => "broadcast-end",
            Message::BroadcastStarted { .. } => "broadcast-started",
            Message::Listen => "listen",
            Message::BroadcastList { .. } => "broadcast-list",
            Message::ConnectRequest { .. } => "connect-request",
            Message::ConnectAccepted { .. } => "connect-accepted",
            Message::ListenerJoined { .. } => "listener-joined",
            Message::Offer { .. } => "offer",
            Message::Answer { .. } => "answer",
            Message::Candidate { .. } => "candidate",
            Message::PairingEnd { .. } => "pairing-end",
            Message::PairingClosed { .. } => "pairing-closed",
            Message::Error { .. } => "error",
        }
    }

    /// Pairing this message belongs to, if any
    pub fn pairing_id(&self) -> Option<&PairingId> {
        match self {
            Message::ConnectAccepted { pairing_id, .. }
            | Message::ListenerJoined { pairing_id, .. }
            | Message::Offer { pairing_id, .. }
            | Message::Answer { pairing_id, .. }
            | Message::Candidate { pairing_id, .. }
            | Message::PairingEnd { pairing_id }
            | Message::PairingClosed { pairing_id } => Some(pairing_id),
            Message::Error { pairing_id, .. } => pairing_id.as_ref(),
            _ => None,
        }
    }

    /// Offer, answer and candidate are relayed between the two ends of a pairing
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Message::Offer { .. } | Message::Answer { .. } | Message::Candidate { .. }
        )
    }

    /// Types only the server may originate
    pub fn is_server_originated(&self) -> bool {
        matches!(
            self,
            Message::BroadcastStarted { .. }
                | Message::BroadcastList { .. }
                | Message::ConnectAccepted { .. }
                | Message::ListenerJoined { .. }
                | Message::PairingClosed { .. }
                | Message::Error { .. }
        )
    }

    /// Build an `error` message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
            pairing_id: None,
        }
    }
}

/// Current Unix time in milliseconds
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a duration as `"{h}h {m}m {s}s"`
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let minutes = seconds / 60;
    let hours = minutes / 60;
    format!("{}h {}m {}s", hours, minutes % 60, seconds % 60)
}
