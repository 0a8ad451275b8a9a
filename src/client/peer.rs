//! Client-side orchestration
//!
//! [`Peer`] ties the signaling channel to the per-pairing negotiation
//! sessions. It is synchronous: every input (a server message, a media
//! event, a user command, a clock tick) returns the messages to send on the
//! channel, and user-visible outcomes are published as [`PeerEvent`]s.
//!
//! ```text
//!   ChannelEvent ──┐
//!   MediaEvent  ───┼──► Peer ──► Vec<Message> ──► SignalingChannel
//!   PeerCommand ───┤      │
//!   tick ──────────┘      └──► PeerEvent ──► application
//! ```

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::protocol::{
    BroadcastId, BroadcastInfo, BroadcastSummary, ErrorCode, Message, PairingId,
};
use crate::session::{
    AudioTrack, FailureReason, MediaEvent, MediaFactory, NegotiationError, NegotiationPhase,
    NegotiationSession,
};

use super::channel::ChannelEvent;
use super::config::ClientConfig;

/// Notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Signaling channel opened
    Connected,
    /// New directory snapshot
    DirectoryUpdated(Vec<BroadcastSummary>),
    /// Our broadcast is on the air
    BroadcastStarted {
        broadcast_id: BroadcastId,
        start_time: u64,
    },
    /// Our broadcast ended (locally or because the channel dropped)
    BroadcastStopped,
    /// A listener joined our broadcast
    ListenerJoined(PairingId),
    /// Media is flowing for a pairing
    SessionConnected(PairingId),
    /// A pairing failed locally
    SessionFailed {
        pairing_id: PairingId,
        reason: FailureReason,
    },
    /// The counterpart or server closed a pairing
    SessionClosed(PairingId),
    /// A local command was refused before reaching the server
    CommandRejected { code: ErrorCode, message: String },
    /// The server reported an error for one of our actions
    ServerError {
        code: ErrorCode,
        message: String,
        pairing_id: Option<PairingId>,
    },
    /// Signaling channel dropped; reconnect in progress
    Disconnected,
    /// Signaling server unreachable; the client has given up
    Unreachable { attempts: u32 },
}

/// User commands
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    StartBroadcast {
        name: String,
        tracks: Vec<AudioTrack>,
    },
    StopBroadcast,
    Listen,
    Connect(BroadcastId),
    Leave(PairingId),
    StopListening,
    Shutdown,
}

/// Local role of this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMode {
    Idle,
    /// Registered, or waiting for the server to confirm
    Broadcasting {
        name: String,
        broadcast_id: Option<BroadcastId>,
    },
    /// Stop requested before the server confirmed the broadcast
    StopPending,
    Listening,
}

/// Error for commands refused locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Broadcast name empty after trimming
    InvalidName,
    /// Already broadcasting
    AlreadyBroadcasting,
    /// Command needs a live broadcast
    NotBroadcasting,
    /// Command conflicts with the current role
    RoleConflict(&'static str),
}

impl PeerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PeerError::InvalidName => ErrorCode::InvalidName,
            PeerError::AlreadyBroadcasting => ErrorCode::AlreadyBroadcasting,
            PeerError::NotBroadcasting => ErrorCode::BroadcastNotFound,
            PeerError::RoleConflict(_) => ErrorCode::RoleConflict,
        }
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::InvalidName => write!(f, "Broadcast name must not be empty"),
            PeerError::AlreadyBroadcasting => write!(f, "Already broadcasting"),
            PeerError::NotBroadcasting => write!(f, "Not broadcasting"),
            PeerError::RoleConflict(action) => {
                write!(f, "Cannot {} in the current role", action)
            }
        }
    }
}

impl std::error::Error for PeerError {}

/// Signaling peer: one broadcaster or listener
pub struct Peer<F: MediaFactory> {
    factory: F,
    config: ClientConfig,
    mode: PeerMode,
    tracks: Vec<AudioTrack>,
    sessions: HashMap<PairingId, NegotiationSession<F::Transport>>,
    directory: Vec<BroadcastSummary>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl<F: MediaFactory> Peer<F> {
    pub fn new(factory: F, config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Self {
            factory,
            config,
            mode: PeerMode::Idle,
            tracks: Vec::new(),
            sessions: HashMap::new(),
            directory: Vec::new(),
            events,
        };
        (peer, rx)
    }

    pub fn mode(&self) -> &PeerMode {
        &self.mode
    }

    /// Last directory snapshot received
    pub fn directory(&self) -> &[BroadcastSummary] {
        &self.directory
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Negotiation phase of one pairing
    pub fn session_phase(&self, pairing_id: &PairingId) -> Option<NegotiationPhase> {
        self.sessions.get(pairing_id).map(|s| s.phase())
    }

    /// Register a broadcast under `name`
    pub fn start_broadcast(
        &mut self,
        name: &str,
        tracks: Vec<AudioTrack>,
    ) -> Result<Vec<Message>, PeerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PeerError::InvalidName);
        }
        match self.mode {
            PeerMode::Idle => {}
            PeerMode::Broadcasting { .. } | PeerMode::StopPending => {
                return Err(PeerError::AlreadyBroadcasting)
            }
            PeerMode::Listening => return Err(PeerError::RoleConflict("start a broadcast")),
        }

        tracing::info!(name = name, tracks = tracks.len(), "Starting broadcast");
        self.tracks = tracks;
        self.mode = PeerMode::Broadcasting {
            name: name.to_string(),
            broadcast_id: None,
        };
        Ok(vec![Message::BroadcastStart {
            broadcast_info: BroadcastInfo::named(name),
        }])
    }

    /// Stop the broadcast and drop every listener
    pub fn stop_broadcast(&mut self) -> Result<Vec<Message>, PeerError> {
        let broadcast_id = match &self.mode {
            PeerMode::Broadcasting { broadcast_id, .. } => broadcast_id.clone(),
            _ => return Err(PeerError::NotBroadcasting),
        };

        // the server closes the pairings along with the broadcast
        self.close_all_sessions();

        match broadcast_id {
            Some(broadcast_id) => {
                tracing::info!(broadcast = %broadcast_id, "Stopping broadcast");
                self.mode = PeerMode::Idle;
                self.emit(PeerEvent::BroadcastStopped);
                Ok(vec![Message::BroadcastEnd { broadcast_id }])
            }
            None => {
                self.mode = PeerMode::StopPending;
                Ok(Vec::new())
            }
        }
    }

    /// Enter listener mode and subscribe to directory pushes
    pub fn listen(&mut self) -> Result<Vec<Message>, PeerError> {
        match self.mode {
            PeerMode::Idle | PeerMode::Listening => {
                self.mode = PeerMode::Listening;
                Ok(vec![Message::Listen])
            }
            _ => Err(PeerError::RoleConflict("listen")),
        }
    }

    /// Ask to join a broadcast
    pub fn connect_to(&mut self, broadcast_id: BroadcastId) -> Result<Vec<Message>, PeerError> {
        match self.mode {
            PeerMode::Idle | PeerMode::Listening => {
                self.mode = PeerMode::Listening;
                tracing::info!(broadcast = %broadcast_id, "Requesting connection");
                Ok(vec![Message::ConnectRequest { broadcast_id }])
            }
            _ => Err(PeerError::RoleConflict("join a broadcast")),
        }
    }

    /// Tear down one pairing
    pub fn leave(&mut self, pairing_id: &PairingId) -> Vec<Message> {
        match self.sessions.remove(pairing_id) {
            Some(session) => {
                session.close();
                vec![Message::PairingEnd {
                    pairing_id: pairing_id.clone(),
                }]
            }
            None => Vec::new(),
        }
    }

    /// Leave every broadcast but keep receiving the directory
    pub fn stop_listening(&mut self) -> Vec<Message> {
        let ids: Vec<PairingId> = self.sessions.keys().cloned().collect();
        ids.iter().flat_map(|id| self.leave(id)).collect()
    }

    /// Run a user command
    ///
    /// Refused commands are reported as [`PeerEvent::CommandRejected`].
    pub fn apply(&mut self, command: PeerCommand) -> Vec<Message> {
        let result = match command {
            PeerCommand::StartBroadcast { name, tracks } => self.start_broadcast(&name, tracks),
            PeerCommand::StopBroadcast => self.stop_broadcast(),
            PeerCommand::Listen => self.listen(),
            PeerCommand::Connect(broadcast_id) => self.connect_to(broadcast_id),
            PeerCommand::Leave(pairing_id) => Ok(self.leave(&pairing_id)),
            PeerCommand::StopListening => Ok(self.stop_listening()),
            PeerCommand::Shutdown => Ok(self.shutdown()),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Command rejected");
            self.emit(PeerEvent::CommandRejected {
                code: e.code(),
                message: e.to_string(),
            });
            Vec::new()
        })
    }

    /// Close everything; returns the farewell messages
    pub fn shutdown(&mut self) -> Vec<Message> {
        let mut out = match self.stop_broadcast() {
            Ok(messages) => messages,
            Err(_) => Vec::new(),
        };
        out.extend(self.stop_listening());
        out
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) -> Vec<Message> {
        match event {
            ChannelEvent::Connected { generation } => self.on_connected(generation),
            ChannelEvent::Message(message) => self.handle_server_message(message),
            ChannelEvent::Disconnected { .. } => {
                self.on_transport_lost();
                self.emit(PeerEvent::Disconnected);
                Vec::new()
            }
            ChannelEvent::Unreachable { attempts } => {
                self.on_transport_lost();
                self.emit(PeerEvent::Unreachable { attempts });
                Vec::new()
            }
        }
    }

    fn on_connected(&mut self, generation: u64) -> Vec<Message> {
        tracing::debug!(generation = generation, mode = ?self.mode, "Channel connected");
        self.emit(PeerEvent::Connected);

        // a listener re-subscribes; pairings are never carried over
        match self.mode {
            PeerMode::Listening => vec![Message::Listen],
            _ => Vec::new(),
        }
    }

    /// Fail every session after the signaling channel dropped
    ///
    /// A reconnect is a new identity on the server, so pairings and the
    /// broadcast registration do not survive it.
    pub fn on_transport_lost(&mut self) {
        for (pairing_id, mut session) in self.sessions.drain() {
            session.transport_lost();
            session.close();
            let _ = self.events.send(PeerEvent::SessionFailed {
                pairing_id,
                reason: FailureReason::TransportLost,
            });
        }

        match self.mode {
            PeerMode::Broadcasting { .. } | PeerMode::StopPending => {
                tracing::warn!("Broadcast lost with the signaling channel");
                self.mode = PeerMode::Idle;
                self.emit(PeerEvent::BroadcastStopped);
            }
            _ => {}
        }
    }

    /// Apply a message from the server
    pub fn handle_server_message(&mut self, message: Message) -> Vec<Message> {
        match message {
            Message::BroadcastStarted {
                broadcast_id,
                start_time,
            } => self.on_broadcast_started(broadcast_id, start_time),
            Message::BroadcastList { broadcasts } => {
                tracing::debug!(count = broadcasts.len(), "Directory updated");
                self.directory = broadcasts.clone();
                self.emit(PeerEvent::DirectoryUpdated(broadcasts));
                Vec::new()
            }
            Message::ListenerJoined { pairing_id, .. } => self.on_listener_joined(pairing_id),
            Message::ConnectAccepted {
                pairing_id,
                broadcast_id,
            } => self.on_connect_accepted(pairing_id, broadcast_id),
            Message::Offer { .. } | Message::Answer { .. } | Message::Candidate { .. } => {
                self.on_negotiation(message)
            }
            Message::PairingClosed { pairing_id } => {
                if let Some(session) = self.sessions.remove(&pairing_id) {
                    tracing::info!(pairing = %pairing_id, "Pairing closed by server");
                    session.close();
                    self.emit(PeerEvent::SessionClosed(pairing_id));
                }
                Vec::new()
            }
            Message::Error {
                code,
                message,
                pairing_id,
            } => {
                self.on_server_error(code, message, pairing_id);
                Vec::new()
            }
            other => {
                tracing::warn!(kind = other.kind(), "Ignoring client-only message from server");
                Vec::new()
            }
        }
    }

    fn on_broadcast_started(&mut self, broadcast_id: BroadcastId, start_time: u64) -> Vec<Message> {
        match &mut self.mode {
            PeerMode::Broadcasting {
                broadcast_id: slot, ..
            } => {
                tracing::info!(broadcast = %broadcast_id, "Broadcast on the air");
                *slot = Some(broadcast_id.clone());
                self.emit(PeerEvent::BroadcastStarted {
                    broadcast_id,
                    start_time,
                });
                Vec::new()
            }
            PeerMode::StopPending => {
                self.mode = PeerMode::Idle;
                self.emit(PeerEvent::BroadcastStopped);
                vec![Message::BroadcastEnd { broadcast_id }]
            }
            _ => {
                tracing::warn!(broadcast = %broadcast_id, "Unexpected broadcast confirmation");
                Vec::new()
            }
        }
    }

    fn on_listener_joined(&mut self, pairing_id: PairingId) -> Vec<Message> {
        if !matches!(
            self.mode,
            PeerMode::Broadcasting {
                broadcast_id: Some(_),
                ..
            }
        ) {
            tracing::warn!(pairing = %pairing_id, "Listener joined while not broadcasting");
            return vec![Message::PairingEnd { pairing_id }];
        }

        let created = self
            .factory
            .create(&pairing_id, &self.config.ice_servers)
            .and_then(|media| {
                NegotiationSession::broadcaster(
                    pairing_id.clone(),
                    media,
                    &self.tracks,
                    self.config.negotiation.clone(),
                )
            });

        let mut session = match created {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(pairing = %pairing_id, error = %e, "Failed to create media transport");
                return self.fail_new_session(pairing_id, FailureReason::MediaFailed);
            }
        };

        if let Err(e) = session.start() {
            tracing::warn!(pairing = %pairing_id, error = %e, "Failed to start negotiation");
            session.close();
            return self.fail_new_session(pairing_id, FailureReason::MediaFailed);
        }

        tracing::info!(pairing = %pairing_id, "Listener joined");
        self.sessions.insert(pairing_id.clone(), session);
        self.emit(PeerEvent::ListenerJoined(pairing_id));
        Vec::new()
    }

    fn on_connect_accepted(
        &mut self,
        pairing_id: PairingId,
        broadcast_id: BroadcastId,
    ) -> Vec<Message> {
        if self.mode != PeerMode::Listening {
            tracing::warn!(pairing = %pairing_id, "Connect accepted while not listening");
            return vec![Message::PairingEnd { pairing_id }];
        }

        match self.factory.create(&pairing_id, &self.config.ice_servers) {
            Ok(media) => {
                tracing::info!(pairing = %pairing_id, broadcast = %broadcast_id, "Joined broadcast");
                let session = NegotiationSession::listener(
                    pairing_id.clone(),
                    media,
                    self.config.negotiation.clone(),
                );
                self.sessions.insert(pairing_id, session);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(pairing = %pairing_id, error = %e, "Failed to create media transport");
                self.fail_new_session(pairing_id, FailureReason::MediaFailed)
            }
        }
    }

    fn on_negotiation(&mut self, message: Message) -> Vec<Message> {
        let Some(pairing_id) = message.pairing_id().cloned() else {
            return Vec::new();
        };
        let Some(session) = self.sessions.get_mut(&pairing_id) else {
            tracing::debug!(pairing = %pairing_id, kind = message.kind(), "No session for pairing");
            return Vec::new();
        };

        match session.on_signal(&message) {
            Ok(()) => Vec::new(),
            Err(NegotiationError::Failed { reason, .. }) => self.end_session(&pairing_id, reason),
            Err(e) => {
                tracing::debug!(pairing = %pairing_id, error = %e, "Negotiation message refused");
                Vec::new()
            }
        }
    }

    fn on_server_error(&mut self, code: ErrorCode, message: String, pairing_id: Option<PairingId>) {
        tracing::warn!(code = %code, message = %message, "Server error");

        if matches!(
            code,
            ErrorCode::InvalidName | ErrorCode::AlreadyBroadcasting
        ) && matches!(
            self.mode,
            PeerMode::Broadcasting {
                broadcast_id: None,
                ..
            } | PeerMode::StopPending
        ) {
            self.mode = PeerMode::Idle;
        }

        if let Some(id) = &pairing_id {
            if let Some(session) = self.sessions.remove(id) {
                session.close();
            }
        }

        self.emit(PeerEvent::ServerError {
            code,
            message,
            pairing_id,
        });
    }

    /// Feed a media transport event for one pairing
    pub fn handle_media_event(&mut self, pairing_id: &PairingId, event: MediaEvent) -> Vec<Message> {
        let Some(session) = self.sessions.get_mut(pairing_id) else {
            tracing::trace!(pairing = %pairing_id, "Media event for closed pairing");
            return Vec::new();
        };

        let was_connected = session.phase() == NegotiationPhase::Connected;
        let mut out = session.on_media_event(event);

        match session.phase() {
            NegotiationPhase::Connected if !was_connected => {
                self.emit(PeerEvent::SessionConnected(pairing_id.clone()));
            }
            NegotiationPhase::Failed(reason) => {
                out.extend(self.end_session(pairing_id, reason));
            }
            _ => {}
        }
        out
    }

    /// Fail sessions that have not connected in time
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<Message> {
        let expired: Vec<PairingId> = self
            .sessions
            .iter_mut()
            .filter_map(|(id, session)| session.poll_timeout(now).then(|| id.clone()))
            .collect();

        let mut out = Vec::new();
        for pairing_id in expired {
            tracing::warn!(pairing = %pairing_id, "Negotiation timed out");
            out.extend(self.end_session(&pairing_id, FailureReason::Timeout));
        }
        out
    }

    /// Remove a failed session and tell the server to close the pairing
    fn end_session(&mut self, pairing_id: &PairingId, reason: FailureReason) -> Vec<Message> {
        if let Some(session) = self.sessions.remove(pairing_id) {
            session.close();
        }
        self.fail_new_session(pairing_id.clone(), reason)
    }

    fn fail_new_session(&mut self, pairing_id: PairingId, reason: FailureReason) -> Vec<Message> {
        if let Some(code) = reason.code() {
            tracing::warn!(pairing = %pairing_id, code = %code, "Session failed");
        }
        self.emit(PeerEvent::SessionFailed {
            pairing_id: pairing_id.clone(),
            reason,
        });
        vec![Message::PairingEnd { pairing_id }]
    }

    fn close_all_sessions(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close();
        }
    }

    fn emit(&self, event: PeerEvent) {
        // the application may have stopped listening
        let _ = self.events.send(event);
    }
}
