//! Per-pairing negotiation
//!
//! Each side of a pairing runs one [`NegotiationSession`]. The session talks
//! to a [`MediaTransport`] through commands and reacts to the transport's
//! [`MediaEvent`]s; the transport itself is supplied by the application.

pub mod media;
pub mod negotiation;

pub use media::{
    AudioTrack, IceServer, MediaError, MediaEvent, MediaFactory, MediaTransport,
    PeerConnectionState, SdpKind,
};
pub use negotiation::{
    FailureReason, NegotiationConfig, NegotiationError, NegotiationPhase, NegotiationSession,
    Role,
};
