//! Negotiation state machine
//!
//! One session per pairing, on each side. It drives the offer, answer and
//! candidate exchange until the media transport connects or the session
//! fails.
//!
//! ```text
//!  Broadcaster:  Idle ──offer ready──► OfferCreated ──answer──► AnswerExchanged ──► Connected
//!  Listener:     Idle ──offer──► OfferReceived ──answer ready──► AnswerExchanged ──► Connected
//!
//!  Any non-terminal phase ──timeout / transport lost / cancel / 3 rejects──► Failed
//! ```
//!
//! Remote candidates that arrive before the remote description are queued
//! and applied in arrival order right after it is set.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::protocol::{ErrorCode, Message, PairingId};

use super::media::{AudioTrack, MediaError, MediaEvent, MediaTransport, PeerConnectionState, SdpKind};

/// Default time from pairing creation to `Connected`
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default consecutive rejections before a session fails
pub const DEFAULT_MAX_REJECTIONS: u32 = 3;

/// Which end of the pairing this session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Broadcaster,
    Listener,
}

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Did not connect within the negotiation timeout
    Timeout,
    /// Media transport or signaling channel lost
    TransportLost,
    /// Cancelled locally or by the counterpart
    Cancelled,
    /// Too many consecutive rejected messages
    Rejected,
    /// The media transport refused a local command
    MediaFailed,
}

impl FailureReason {
    /// Code shown to the user, for failures that have one
    pub fn code(self) -> Option<ErrorCode> {
        match self {
            FailureReason::Timeout => Some(ErrorCode::NegotiationTimeout),
            _ => None,
        }
    }
}

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Session created, nothing exchanged yet
    Idle,
    /// Broadcaster sent its offer
    OfferCreated,
    /// Listener applied the remote offer, answer pending
    OfferReceived,
    /// Both descriptions applied
    AnswerExchanged,
    /// Media transport established
    Connected,
    /// Terminal failure
    Failed(FailureReason),
}

impl NegotiationPhase {
    /// `Connected` and `Failed` accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationPhase::Connected | NegotiationPhase::Failed(_))
    }
}

/// Negotiation tuning
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Time allowed from creation to `Connected`
    pub timeout: Duration,
    /// Consecutive rejected messages before failing
    pub max_rejections: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_rejections: DEFAULT_MAX_REJECTIONS,
        }
    }
}

/// Error type for negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Message not accepted in the current phase
    UnexpectedMessage {
        pairing_id: PairingId,
        kind: &'static str,
        phase: NegotiationPhase,
    },
    /// Message tagged with a different pairing
    WrongPairing {
        expected: PairingId,
        actual: Option<PairingId>,
    },
    /// Media transport rejected a remote description or candidate
    Media(MediaError),
    /// Session reached `Failed`; the pairing should be torn down
    Failed {
        pairing_id: PairingId,
        reason: FailureReason,
    },
    /// Session already finished; late messages are dropped
    Finished(PairingId),
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationError::UnexpectedMessage {
                pairing_id,
                kind,
                phase,
            } => write!(
                f,
                "Unexpected {} for pairing {} in phase {:?}",
                kind, pairing_id, phase
            ),
            NegotiationError::WrongPairing { expected, actual } => {
                write!(f, "Message for pairing {:?}, expected {}", actual, expected)
            }
            NegotiationError::Media(e) => write!(f, "{}", e),
            NegotiationError::Failed { pairing_id, reason } => {
                write!(f, "Negotiation failed for pairing {}: {:?}", pairing_id, reason)
            }
            NegotiationError::Finished(id) => write!(f, "Pairing {} already finished", id),
        }
    }
}

impl std::error::Error for NegotiationError {}

impl From<MediaError> for NegotiationError {
    fn from(e: MediaError) -> Self {
        NegotiationError::Media(e)
    }
}

/// Per-pairing negotiation state
pub struct NegotiationSession<M: MediaTransport> {
    pairing_id: PairingId,
    role: Role,
    phase: NegotiationPhase,
    media: M,
    media_closed: bool,
    remote_description_set: bool,
    /// Remote candidates received before the remote description
    pending_candidates: VecDeque<Value>,
    /// Consecutive rejected messages
    rejections: u32,
    created_at: Instant,
    config: NegotiationConfig,
}

impl<M: MediaTransport> NegotiationSession<M> {
    /// Create the broadcaster end, attaching the local audio tracks
    pub fn broadcaster(
        pairing_id: PairingId,
        mut media: M,
        tracks: &[AudioTrack],
        config: NegotiationConfig,
    ) -> Result<Self, MediaError> {
        for track in tracks {
            media.add_track(track)?;
        }
        Ok(Self::new(pairing_id, Role::Broadcaster, media, config))
    }

    /// Create the listener end; it waits for the broadcaster's offer
    pub fn listener(pairing_id: PairingId, media: M, config: NegotiationConfig) -> Self {
        Self::new(pairing_id, Role::Listener, media, config)
    }

    fn new(pairing_id: PairingId, role: Role, media: M, config: NegotiationConfig) -> Self {
        Self {
            pairing_id,
            role,
            phase: NegotiationPhase::Idle,
            media,
            media_closed: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            rejections: 0,
            created_at: Instant::now(),
            config,
        }
    }

    /// Kick off the broadcaster's offer
    ///
    /// The offer is sent once the transport reports the local description.
    pub fn start(&mut self) -> Result<(), NegotiationError> {
        if self.role != Role::Broadcaster || self.phase != NegotiationPhase::Idle {
            return Err(self.unexpected("start"));
        }

        if let Err(e) = self.media.create_offer() {
            tracing::warn!(pairing = %self.pairing_id, error = %e, "Failed to create offer");
            return Err(self.fail(FailureReason::MediaFailed));
        }
        Ok(())
    }

    /// Apply a negotiation message relayed from the counterpart
    pub fn on_signal(&mut self, message: &Message) -> Result<(), NegotiationError> {
        if self.phase.is_terminal() && !self.accepts_late(message) {
            tracing::debug!(
                pairing = %self.pairing_id,
                kind = message.kind(),
                "Dropping message for finished negotiation"
            );
            return Err(NegotiationError::Finished(self.pairing_id.clone()));
        }

        if message.pairing_id() != Some(&self.pairing_id) {
            let err = NegotiationError::WrongPairing {
                expected: self.pairing_id.clone(),
                actual: message.pairing_id().cloned(),
            };
            return self.reject(err);
        }

        let result = match (self.role, self.phase, message) {
            (Role::Listener, NegotiationPhase::Idle, Message::Offer { sdp, .. }) => {
                self.accept_offer(sdp)
            }
            (Role::Broadcaster, NegotiationPhase::OfferCreated, Message::Answer { sdp, .. }) => {
                self.accept_answer(sdp)
            }
            (_, _, Message::Candidate { candidate, .. }) => self.accept_candidate(candidate),
            _ => Err(self.unexpected(message.kind())),
        };

        match result {
            Ok(()) => {
                self.rejections = 0;
                Ok(())
            }
            // a local command failure already moved the session to Failed
            Err(err @ NegotiationError::Failed { .. }) => Err(err),
            Err(err) => self.reject(err),
        }
    }

    /// React to an event from the media transport
    ///
    /// Returns the messages to send to the counterpart through the router.
    pub fn on_media_event(&mut self, event: MediaEvent) -> Vec<Message> {
        match event {
            MediaEvent::LocalDescription {
                kind: SdpKind::Offer,
                sdp,
            } if self.role == Role::Broadcaster && self.phase == NegotiationPhase::Idle => {
                self.phase = NegotiationPhase::OfferCreated;
                tracing::debug!(pairing = %self.pairing_id, "Offer created");
                vec![Message::Offer {
                    pairing_id: self.pairing_id.clone(),
                    sdp,
                }]
            }
            MediaEvent::LocalDescription {
                kind: SdpKind::Answer,
                sdp,
            } if self.role == Role::Listener && self.phase == NegotiationPhase::OfferReceived => {
                self.phase = NegotiationPhase::AnswerExchanged;
                tracing::debug!(pairing = %self.pairing_id, "Answer created");
                vec![Message::Answer {
                    pairing_id: self.pairing_id.clone(),
                    sdp,
                }]
            }
            MediaEvent::LocalDescription { kind, .. } => {
                tracing::warn!(
                    pairing = %self.pairing_id,
                    kind = ?kind,
                    phase = ?self.phase,
                    "Ignoring stray local description"
                );
                Vec::new()
            }
            MediaEvent::LocalCandidate(candidate) => {
                if matches!(self.phase, NegotiationPhase::Failed(_)) {
                    return Vec::new();
                }
                vec![Message::Candidate {
                    pairing_id: self.pairing_id.clone(),
                    candidate,
                }]
            }
            MediaEvent::ConnectionState(state) => {
                self.on_connection_state(state);
                Vec::new()
            }
        }
    }

    fn on_connection_state(&mut self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected if self.phase == NegotiationPhase::AnswerExchanged => {
                self.phase = NegotiationPhase::Connected;
                tracing::info!(
                    pairing = %self.pairing_id,
                    role = ?self.role,
                    elapsed_ms = self.created_at.elapsed().as_millis() as u64,
                    "Negotiation connected"
                );
            }
            PeerConnectionState::Failed | PeerConnectionState::Closed => {
                if !matches!(self.phase, NegotiationPhase::Failed(_)) {
                    self.fail(FailureReason::TransportLost);
                }
            }
            other => {
                tracing::trace!(pairing = %self.pairing_id, state = ?other, "Transport state");
            }
        }
    }

    /// Fail the session if it has not connected within the timeout
    ///
    /// Called from the client loop's tick. Returns true if this call failed it.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        if now.saturating_duration_since(self.created_at) < self.config.timeout {
            return false;
        }
        self.fail(FailureReason::Timeout);
        true
    }

    /// Fail the session because the signaling channel dropped
    pub fn transport_lost(&mut self) {
        if !matches!(self.phase, NegotiationPhase::Failed(_)) {
            self.fail(FailureReason::TransportLost);
        }
    }

    /// End the session and release the media transport
    pub fn close(mut self) {
        if !self.phase.is_terminal() {
            self.phase = NegotiationPhase::Failed(FailureReason::Cancelled);
        }
        self.close_media();
    }

    pub fn pairing_id(&self) -> &PairingId {
        &self.pairing_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.phase, NegotiationPhase::Failed(_))
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        self.media.set_remote_description(SdpKind::Offer, sdp)?;
        self.remote_description_set = true;
        self.phase = NegotiationPhase::OfferReceived;
        self.flush_candidates();

        if let Err(e) = self.media.create_answer() {
            tracing::warn!(pairing = %self.pairing_id, error = %e, "Failed to create answer");
            return Err(self.fail(FailureReason::MediaFailed));
        }
        Ok(())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        self.media.set_remote_description(SdpKind::Answer, sdp)?;
        self.remote_description_set = true;
        self.phase = NegotiationPhase::AnswerExchanged;
        self.flush_candidates();
        Ok(())
    }

    fn accept_candidate(&mut self, candidate: &Value) -> Result<(), NegotiationError> {
        if self.remote_description_set {
            self.media.add_ice_candidate(candidate)?;
        } else {
            self.pending_candidates.push_back(candidate.clone());
            tracing::trace!(
                pairing = %self.pairing_id,
                pending = self.pending_candidates.len(),
                "Buffered early candidate"
            );
        }
        Ok(())
    }

    fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return;
        }

        tracing::debug!(
            pairing = %self.pairing_id,
            count = pending.len(),
            "Applying buffered candidates"
        );

        for candidate in pending {
            if let Err(e) = self.media.add_ice_candidate(&candidate) {
                tracing::warn!(pairing = %self.pairing_id, error = %e, "Buffered candidate rejected");
            }
        }
    }

    /// Late candidates still trickle in after the transport connects
    fn accepts_late(&self, message: &Message) -> bool {
        self.phase == NegotiationPhase::Connected && matches!(message, Message::Candidate { .. })
    }

    fn reject(&mut self, err: NegotiationError) -> Result<(), NegotiationError> {
        self.rejections += 1;
        tracing::warn!(
            pairing = %self.pairing_id,
            rejections = self.rejections,
            error = %err,
            "Rejected negotiation message"
        );

        if self.rejections >= self.config.max_rejections {
            return Err(self.fail(FailureReason::Rejected));
        }
        Err(err)
    }

    fn unexpected(&self, kind: &'static str) -> NegotiationError {
        NegotiationError::UnexpectedMessage {
            pairing_id: self.pairing_id.clone(),
            kind,
            phase: self.phase,
        }
    }

    fn fail(&mut self, reason: FailureReason) -> NegotiationError {
        self.phase = NegotiationPhase::Failed(reason);
        self.pending_candidates.clear();
        self.close_media();

        tracing::warn!(
            pairing = %self.pairing_id,
            role = ?self.role,
            reason = ?reason,
            "Negotiation failed"
        );

        NegotiationError::Failed {
            pairing_id: self.pairing_id.clone(),
            reason,
        }
    }

    fn close_media(&mut self) {
        if !self.media_closed {
            self.media.close();
            self.media_closed = true;
        }
    }
}
