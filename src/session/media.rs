//! Media transport seam
//!
//! The negotiation state machine drives a peer-to-peer media transport but
//! never implements one. Commands are fire-and-forget; their results come
//! back later as [`MediaEvent`]s on the owning client loop.

use serde_json::Value;

use crate::protocol::PairingId;

/// Which half of the session description exchange an SDP belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connection state reported by the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    /// Transient loss; the transport may recover on its own
    Disconnected,
    Failed,
    Closed,
}

/// Event emitted by a media transport
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A local description finished generating
    LocalDescription { kind: SdpKind, sdp: String },
    /// A local network-path candidate was discovered
    LocalCandidate(Value),
    /// Transport connection state changed
    ConnectionState(PeerConnectionState),
}

/// Handle to one local captured audio track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub id: String,
    pub label: String,
}

impl AudioTrack {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Error reported by a media transport command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaError(pub String);

impl MediaError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Media transport error: {}", self.0)
    }
}

impl std::error::Error for MediaError {}

/// Peer-to-peer media transport driven by a negotiation session
///
/// `create_offer` and `create_answer` complete asynchronously by emitting
/// [`MediaEvent::LocalDescription`]. Local candidates are reported as
/// [`MediaEvent::LocalCandidate`].
pub trait MediaTransport {
    /// Start generating a local offer
    fn create_offer(&mut self) -> Result<(), MediaError>;

    /// Start generating a local answer to the applied remote offer
    fn create_answer(&mut self) -> Result<(), MediaError>;

    /// Apply the counterpart's session description
    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;

    /// Apply one of the counterpart's network-path candidates
    fn add_ice_candidate(&mut self, candidate: &Value) -> Result<(), MediaError>;

    /// Attach a local audio track to be sent
    fn add_track(&mut self, track: &AudioTrack) -> Result<(), MediaError>;

    /// Release the transport
    fn close(&mut self);
}

/// STUN/TURN server handed to media transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// Server reachable without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Public Google STUN servers
    pub fn default_stun() -> Vec<Self> {
        vec![Self {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            username: None,
            credential: None,
        }]
    }
}

/// Creates one media transport per pairing
pub trait MediaFactory {
    type Transport: MediaTransport;

    fn create(
        &mut self,
        pairing_id: &PairingId,
        ice_servers: &[IceServer],
    ) -> Result<Self::Transport, MediaError>;
}
