//! Signaling hub
//!
//! The hub is the server's single event loop. It exclusively owns the table
//! of open connections, the [`Directory`] and the [`Router`], and processes
//! one [`HubEvent`] at a time, so none of them needs a lock.
//!
//! ```text
//!   connection task ──┐                    ┌──► outbound queue ──► connection task
//!   connection task ──┼── HubEvent ──► Hub ┼──► outbound queue ──► connection task
//!   connection task ──┘    (mpsc)      ▲   └──► outbound queue ──► connection task
//!                                      │
//!                              interval tick
//!                   (directory push, liveness sweep, stats)
//! ```
//!
//! Closing a connection removes its broadcast and every pairing it takes
//! part in while handling that one event, before the next event is looked at.
//!
//! Each connection's outbound path is bounded. Replies and relayed messages
//! share a queue of `outbound_queue_capacity`; a connection that lets it fill
//! up is dropped. Directory pushes bypass the queue and overwrite a single
//! slot, so a slow listener only ever has the newest snapshot pending.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::directory::{ConnectionId, Directory};
use crate::error::Error;
use crate::protocol::{
    unix_millis, BroadcastId, BroadcastInfo, BroadcastSummary, ErrorCode, Message, PairingId,
};
use crate::router::{Delivery, Pairing, Router};
use crate::stats::{ServerStats, StatsRecorder};

use super::config::ServerConfig;

/// Hub side of one connection's outbound path
#[derive(Debug, Clone)]
pub struct Outbound {
    messages: mpsc::Sender<Message>,
    directory: watch::Sender<Vec<BroadcastSummary>>,
}

/// Connection side of [`Outbound`]
#[derive(Debug)]
pub struct Inbox {
    /// Replies and relayed messages, in order
    pub messages: mpsc::Receiver<Message>,
    /// Newest directory snapshot not yet written
    pub directory: watch::Receiver<Vec<BroadcastSummary>>,
}

/// Create the outbound path of one connection
pub fn outbound(capacity: usize) -> (Outbound, Inbox) {
    let (messages_tx, messages_rx) = mpsc::channel(capacity.max(1));
    let (directory_tx, directory_rx) = watch::channel(Vec::new());
    (
        Outbound {
            messages: messages_tx,
            directory: directory_tx,
        },
        Inbox {
            messages: messages_rx,
            directory: directory_rx,
        },
    )
}

/// Input to the hub from connection tasks
#[derive(Debug)]
pub enum HubEvent {
    /// A websocket finished its upgrade
    Opened {
        id: ConnectionId,
        peer_addr: SocketAddr,
        tx: Outbound,
    },
    /// A decoded message arrived
    Received { id: ConnectionId, message: Message },
    /// The connection is gone
    Closed { id: ConnectionId },
}

/// Role of a connection, fixed by its first role-defining message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Unassigned,
    Broadcaster,
    Listener,
}

#[derive(Debug)]
struct ConnectionEntry {
    peer_addr: SocketAddr,
    role: ConnectionRole,
    tx: Outbound,
    opened_at: Instant,
    /// Id the client put in its `broadcastInfo`, accepted on `broadcast-end`
    announced_id: Option<BroadcastId>,
}

/// Server-side owner of all signaling state
pub struct Hub {
    config: ServerConfig,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    directory: Directory,
    router: Router,
    stats: StatsRecorder,
    stats_tx: watch::Sender<ServerStats>,
    last_stats_log: Instant,
}

impl Hub {
    /// Create a hub and the receiver its stats are published on
    pub fn new(config: ServerConfig) -> (Self, watch::Receiver<ServerStats>) {
        let (stats_tx, stats_rx) = watch::channel(ServerStats::new());
        let hub = Self {
            router: Router::with_max_listeners(config.max_listeners_per_broadcast),
            config,
            connections: HashMap::new(),
            directory: Directory::new(),
            stats: StatsRecorder::new(),
            stats_tx,
            last_stats_log: Instant::now(),
        };
        (hub, stats_rx)
    }

    /// Run until every event sender is dropped
    pub async fn run(mut self, mut events: mpsc::Receiver<HubEvent>) {
        let period = self
            .config
            .directory_push_interval
            .max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
        }

        tracing::debug!(connections = self.connections.len(), "Hub stopped");
    }

    /// Process one event
    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Opened { id, peer_addr, tx } => self.on_opened(id, peer_addr, tx),
            HubEvent::Received { id, message } => self.on_message(id, message),
            HubEvent::Closed { id } => self.on_closed(id),
        }

        // structural changes are pushed right away; the tick covers the rest
        if self.directory.take_changed() {
            self.push_directory();
        }
    }

    /// Periodic work: liveness sweep, directory push, stats
    pub fn on_tick(&mut self, now: Instant) {
        let removed = {
            let connections = &self.connections;
            self.directory
                .prune(|owner| connections.contains_key(&owner))
        };
        for broadcast in removed {
            self.close_broadcast_pairings(&broadcast.id);
        }

        self.directory.take_changed();
        self.push_directory();

        let stats = self.stats();
        if now.saturating_duration_since(self.last_stats_log) >= self.config.stats_interval {
            self.last_stats_log = now;
            stats.log();
        }
        self.stats_tx.send_replace(stats);
    }

    /// Current stats
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.directory.len(), self.router.len())
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Role of an open connection
    pub fn role(&self, id: ConnectionId) -> Option<ConnectionRole> {
        self.connections.get(&id).map(|c| c.role)
    }

    fn on_opened(&mut self, id: ConnectionId, peer_addr: SocketAddr, tx: Outbound) {
        tracing::info!(connection_id = id, peer = %peer_addr, "Connection opened");
        self.stats.connection_opened();
        self.connections.insert(
            id,
            ConnectionEntry {
                peer_addr,
                role: ConnectionRole::Unassigned,
                tx,
                opened_at: Instant::now(),
                announced_id: None,
            },
        );
    }

    fn on_closed(&mut self, id: ConnectionId) {
        let Some(entry) = self.connections.remove(&id) else {
            return;
        };
        self.stats.connection_closed();

        if let Some(broadcast) = self.directory.unregister(id) {
            self.close_broadcast_pairings(&broadcast.id);
        }
        for pairing in self.router.teardown_connection(&mut self.directory, id) {
            self.notify_closed(&pairing, id);
        }

        tracing::info!(
            connection_id = id,
            peer = %entry.peer_addr,
            role = ?entry.role,
            duration_secs = entry.opened_at.elapsed().as_secs(),
            "Connection closed"
        );
    }

    fn on_message(&mut self, id: ConnectionId, message: Message) {
        if !self.connections.contains_key(&id) {
            tracing::debug!(connection_id = id, "Message from unknown connection");
            return;
        }

        if message.is_server_originated() {
            tracing::warn!(
                connection_id = id,
                kind = message.kind(),
                "Client sent a server-only message"
            );
            self.send_error(
                id,
                ErrorCode::MalformedMessage,
                format!("{} is not accepted from clients", message.kind()),
                None,
            );
            return;
        }

        match message {
            Message::BroadcastStart { broadcast_info } => self.on_broadcast_start(id, broadcast_info),
            Message::BroadcastEnd { broadcast_id } => self.on_broadcast_end(id, &broadcast_id),
            Message::Listen => self.on_listen(id),
            Message::ConnectRequest { broadcast_id } => self.on_connect_request(id, &broadcast_id),
            Message::Offer { .. } | Message::Answer { .. } | Message::Candidate { .. } => {
                self.on_negotiation(id, message)
            }
            Message::PairingEnd { pairing_id } => self.on_pairing_end(id, &pairing_id),
            // server-originated types were turned away above
            _ => {}
        }
    }

    fn on_broadcast_start(&mut self, id: ConnectionId, info: BroadcastInfo) {
        if !self.claim_role(id, ConnectionRole::Broadcaster) {
            return;
        }

        match self.directory.register(id, &info.name) {
            Ok(broadcast_id) => {
                if let Some(entry) = self.connections.get_mut(&id) {
                    entry.announced_id = info.id;
                }
                let start_time = self
                    .directory
                    .get(&broadcast_id)
                    .map(|b| b.start_time_ms())
                    .unwrap_or_else(|| unix_millis(std::time::SystemTime::now()));
                self.deliver(
                    id,
                    Message::BroadcastStarted {
                        broadcast_id,
                        start_time,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(connection_id = id, error = %e, "Broadcast rejected");
                if self.directory.owned_by(id).is_none() {
                    self.release_role(id);
                }
                self.reject(id, e.into(), None);
            }
        }
    }

    fn on_broadcast_end(&mut self, id: ConnectionId, broadcast_id: &BroadcastId) {
        let Some(owned) = self.directory.owned_by(id).map(|b| b.id.clone()) else {
            tracing::debug!(connection_id = id, broadcast = %broadcast_id, "No broadcast to end");
            return;
        };

        let announced = self
            .connections
            .get(&id)
            .and_then(|c| c.announced_id.as_ref());
        if &owned != broadcast_id && announced != Some(broadcast_id) {
            tracing::warn!(
                connection_id = id,
                broadcast = %broadcast_id,
                owned = %owned,
                "Ignoring end for a broadcast this connection does not own"
            );
            return;
        }

        self.directory.unregister(id);
        self.close_broadcast_pairings(&owned);
        self.release_role(id);
    }

    fn on_listen(&mut self, id: ConnectionId) {
        if !self.claim_role(id, ConnectionRole::Listener) {
            return;
        }
        let broadcasts = self.directory.snapshot();
        tracing::debug!(connection_id = id, count = broadcasts.len(), "Listener subscribed");
        if let Some(entry) = self.connections.get(&id) {
            entry.tx.directory.send_replace(broadcasts);
        }
    }

    fn on_connect_request(&mut self, id: ConnectionId, broadcast_id: &BroadcastId) {
        if !self.claim_role(id, ConnectionRole::Listener) {
            return;
        }

        match self
            .router
            .request_connect(&mut self.directory, id, broadcast_id)
        {
            Ok((_pairing_id, deliveries)) => {
                for Delivery { to, message } in deliveries {
                    self.deliver(to, message);
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = id, error = %e, "Connect request rejected");
                self.reject(id, e.into(), None);
            }
        }
    }

    fn on_negotiation(&mut self, id: ConnectionId, message: Message) {
        let Some(pairing_id) = message.pairing_id().cloned() else {
            return;
        };

        match self.router.relay(&pairing_id, id, message) {
            Ok(Delivery { to, message }) => {
                self.stats.relayed();
                self.deliver(to, message);
            }
            Err(e) => {
                self.stats.relay_missed();
                tracing::warn!(connection_id = id, error = %e, "Relay rejected");
                self.reject(id, e.into(), Some(pairing_id));
            }
        }
    }

    fn on_pairing_end(&mut self, id: ConnectionId, pairing_id: &PairingId) {
        let involved = self
            .router
            .get(pairing_id)
            .map(|p| p.involves(id))
            .unwrap_or(false);
        if !involved {
            // the other side may have closed it first
            tracing::debug!(connection_id = id, pairing = %pairing_id, "Pairing already gone");
            return;
        }

        if let Some(pairing) = self.router.teardown(&mut self.directory, pairing_id) {
            self.notify_closed(&pairing, id);
        }
    }

    /// Fix the connection's role, or reject with `RoleConflict`
    fn claim_role(&mut self, id: ConnectionId, wanted: ConnectionRole) -> bool {
        let Some(entry) = self.connections.get_mut(&id) else {
            return false;
        };

        match entry.role {
            ConnectionRole::Unassigned => {
                entry.role = wanted;
                tracing::debug!(connection_id = id, role = ?wanted, "Role assigned");
                true
            }
            role if role == wanted => true,
            role => {
                tracing::warn!(connection_id = id, role = ?role, wanted = ?wanted, "Role conflict");
                self.send_error(
                    id,
                    ErrorCode::RoleConflict,
                    format!("connection is already a {:?}", role).to_lowercase(),
                    None,
                );
                false
            }
        }
    }

    /// A broadcaster that no longer owns a broadcast may take either role again
    fn release_role(&mut self, id: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            if entry.role == ConnectionRole::Broadcaster {
                tracing::debug!(connection_id = id, "Role released");
                entry.role = ConnectionRole::Unassigned;
                entry.announced_id = None;
            }
        }
    }

    fn close_broadcast_pairings(&mut self, broadcast_id: &BroadcastId) {
        for pairing in self.router.teardown_broadcast(&mut self.directory, broadcast_id) {
            self.notify_closed(&pairing, pairing.broadcaster);
        }
    }

    /// Tell the other end of `pairing` that it was torn down by `by`
    fn notify_closed(&mut self, pairing: &Pairing, by: ConnectionId) {
        if let Some(other) = pairing.counterpart(by) {
            self.deliver(
                other,
                Message::PairingClosed {
                    pairing_id: pairing.id.clone(),
                },
            );
        }
    }

    fn push_directory(&mut self) {
        let listeners: Vec<&ConnectionEntry> = self
            .connections
            .values()
            .filter(|c| c.role == ConnectionRole::Listener)
            .collect();
        if listeners.is_empty() {
            return;
        }

        let broadcasts = self.directory.snapshot();
        tracing::debug!(
            listeners = listeners.len(),
            broadcasts = broadcasts.len(),
            "Pushing directory"
        );
        for entry in listeners {
            entry.tx.directory.send_replace(broadcasts.clone());
        }
        self.stats.directory_pushed();
    }

    /// Report a failed action back to the connection that asked for it
    fn reject(&mut self, id: ConnectionId, error: Error, pairing_id: Option<PairingId>) {
        let code = error.code().unwrap_or(ErrorCode::MalformedMessage);
        self.send_error(id, code, error.to_string(), pairing_id);
    }

    fn send_error(
        &mut self,
        id: ConnectionId,
        code: ErrorCode,
        message: String,
        pairing_id: Option<PairingId>,
    ) {
        self.deliver(
            id,
            Message::Error {
                code,
                message,
                pairing_id,
            },
        );
    }

    fn deliver(&mut self, to: ConnectionId, message: Message) {
        let Some(entry) = self.connections.get(&to) else {
            tracing::debug!(connection_id = to, kind = message.kind(), "Recipient gone");
            return;
        };
        match entry.tx.messages.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!(
                    connection_id = to,
                    kind = message.kind(),
                    "Outbound queue full, dropping connection"
                );
                // dropping the entry closes its queue, which ends the connection task
                self.on_closed(to);
            }
            Err(TrySendError::Closed(_)) => {
                // its task ended; the Closed event is on its way
                tracing::debug!(connection_id = to, "Outbound queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct TestConn {
        id: ConnectionId,
        inbox: Inbox,
    }

    impl TestConn {
        /// Queued messages, then the pending directory snapshot if any
        fn drain(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(message) = self.inbox.messages.try_recv() {
                out.push(message);
            }
            if self.inbox.directory.has_changed().unwrap_or(false) {
                out.push(Message::BroadcastList {
                    broadcasts: self.inbox.directory.borrow_and_update().clone(),
                });
            }
            out
        }
    }

    fn hub() -> Hub {
        Hub::new(ServerConfig::default()).0
    }

    fn open(hub: &mut Hub, id: ConnectionId) -> TestConn {
        let (tx, inbox) = outbound(hub.config.outbound_queue_capacity);
        hub.handle(HubEvent::Opened {
            id,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 40_000 + id as u16)),
            tx,
        });
        TestConn { id, inbox }
    }

    fn send(hub: &mut Hub, conn: &TestConn, message: Message) {
        hub.handle(HubEvent::Received {
            id: conn.id,
            message,
        });
    }

    fn start(hub: &mut Hub, conn: &mut TestConn, name: &str) -> BroadcastId {
        send(
            hub,
            conn,
            Message::BroadcastStart {
                broadcast_info: BroadcastInfo::named(name),
            },
        );
        match conn.drain().as_slice() {
            [Message::BroadcastStarted { broadcast_id, .. }] => broadcast_id.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Connect `listener` and return the pairing id from both sides
    fn join(
        hub: &mut Hub,
        listener: &mut TestConn,
        broadcaster: &mut TestConn,
        broadcast_id: &BroadcastId,
    ) -> PairingId {
        send(
            hub,
            listener,
            Message::ConnectRequest {
                broadcast_id: broadcast_id.clone(),
            },
        );
        let accepted = listener
            .drain()
            .into_iter()
            .find_map(|m| match m {
                Message::ConnectAccepted { pairing_id, .. } => Some(pairing_id),
                _ => None,
            })
            .unwrap();
        let joined = broadcaster
            .drain()
            .into_iter()
            .find_map(|m| match m {
                Message::ListenerJoined { pairing_id, .. } => Some(pairing_id),
                _ => None,
            })
            .unwrap();
        assert_eq!(accepted, joined);
        accepted
    }

    fn error_code(messages: &[Message]) -> Option<ErrorCode> {
        messages.iter().find_map(|m| match m {
            Message::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    #[test]
    fn test_register_then_listen_shows_broadcast() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        start(&mut hub, &mut broadcaster, "Jazz FM");
        send(&mut hub, &listener, Message::Listen);

        match listener.drain().as_slice() {
            [Message::BroadcastList { broadcasts }] => {
                assert_eq!(broadcasts.len(), 1);
                assert_eq!(broadcasts[0].name, "Jazz FM");
                assert_eq!(broadcasts[0].listener_count, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hub.role(1), Some(ConnectionRole::Broadcaster));
        assert_eq!(hub.role(2), Some(ConnectionRole::Listener));
    }

    #[test]
    fn test_full_negotiation_relay() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        let pairing_id = join(&mut hub, &mut listener, &mut broadcaster, &broadcast_id);

        let offer = Message::Offer {
            pairing_id: pairing_id.clone(),
            sdp: "O1".into(),
        };
        send(&mut hub, &broadcaster, offer.clone());
        let received: Vec<Message> = listener
            .drain()
            .into_iter()
            .filter(|m| m.is_negotiation())
            .collect();
        assert_eq!(received, vec![offer]);

        let answer = Message::Answer {
            pairing_id: pairing_id.clone(),
            sdp: "A1".into(),
        };
        send(&mut hub, &listener, answer.clone());
        assert_eq!(broadcaster.drain(), vec![answer]);

        assert_eq!(hub.stats().messages_relayed, 2);
    }

    #[test]
    fn test_connect_to_missing_broadcast() {
        let mut hub = hub();
        let mut listener = open(&mut hub, 1);

        send(
            &mut hub,
            &listener,
            Message::ConnectRequest {
                broadcast_id: BroadcastId::new("missing"),
            },
        );

        assert_eq!(
            error_code(&listener.drain()),
            Some(ErrorCode::BroadcastNotFound)
        );
        assert!(hub.router().is_empty());
        assert!(hub.directory().is_empty());
    }

    #[test]
    fn test_two_listeners_isolated() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut first = open(&mut hub, 2);
        let mut second = open(&mut hub, 3);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        let p1 = join(&mut hub, &mut first, &mut broadcaster, &broadcast_id);
        let p2 = join(&mut hub, &mut second, &mut broadcaster, &broadcast_id);
        assert_ne!(p1, p2);
        assert_eq!(hub.directory().get(&broadcast_id).unwrap().listener_count, 2);
        assert_eq!(hub.router().len(), 2);

        first.drain();
        second.drain();
        send(
            &mut hub,
            &broadcaster,
            Message::Candidate {
                pairing_id: p1.clone(),
                candidate: json!({"candidate": "only-for-first"}),
            },
        );

        assert_eq!(first.drain().len(), 1);
        assert!(second.drain().is_empty());
    }

    #[test]
    fn test_broadcaster_close_tears_down_everything() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        let pairing_id = join(&mut hub, &mut listener, &mut broadcaster, &broadcast_id);
        listener.drain();

        hub.handle(HubEvent::Closed { id: broadcaster.id });

        assert!(hub.directory().is_empty());
        assert!(hub.router().is_empty());

        let messages = listener.drain();
        assert!(messages.contains(&Message::PairingClosed {
            pairing_id: pairing_id.clone()
        }));
        assert!(messages.contains(&Message::BroadcastList {
            broadcasts: Vec::new()
        }));

        // relaying on the dead pairing is an UnknownPairing, not a crash
        send(
            &mut hub,
            &listener,
            Message::Answer {
                pairing_id,
                sdp: "late".into(),
            },
        );
        assert_eq!(error_code(&listener.drain()), Some(ErrorCode::UnknownPairing));
        assert_eq!(hub.stats().relay_misses, 1);
    }

    #[test]
    fn test_listener_close_decrements_count() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        let pairing_id = join(&mut hub, &mut listener, &mut broadcaster, &broadcast_id);

        hub.handle(HubEvent::Closed { id: listener.id });

        assert_eq!(hub.directory().get(&broadcast_id).unwrap().listener_count, 0);
        assert_eq!(
            broadcaster.drain(),
            vec![Message::PairingClosed { pairing_id }]
        );
    }

    #[test]
    fn test_pairing_end_notifies_counterpart() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        let pairing_id = join(&mut hub, &mut listener, &mut broadcaster, &broadcast_id);

        send(
            &mut hub,
            &listener,
            Message::PairingEnd {
                pairing_id: pairing_id.clone(),
            },
        );
        assert_eq!(
            broadcaster.drain(),
            vec![Message::PairingClosed {
                pairing_id: pairing_id.clone()
            }]
        );

        // ending it again is a no-op
        send(&mut hub, &broadcaster, Message::PairingEnd { pairing_id });
        assert!(listener
            .drain()
            .iter()
            .all(|m| !matches!(m, Message::PairingClosed { .. } | Message::Error { .. })));
    }

    #[test]
    fn test_stranger_cannot_relay_or_end() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);
        let mut stranger = open(&mut hub, 3);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        let pairing_id = join(&mut hub, &mut listener, &mut broadcaster, &broadcast_id);

        send(
            &mut hub,
            &stranger,
            Message::Offer {
                pairing_id: pairing_id.clone(),
                sdp: "x".into(),
            },
        );
        assert_eq!(error_code(&stranger.drain()), Some(ErrorCode::UnknownPairing));

        send(&mut hub, &stranger, Message::PairingEnd { pairing_id: pairing_id.clone() });
        assert!(hub.router().get(&pairing_id).is_some());
    }

    #[test]
    fn test_role_conflict() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        start(&mut hub, &mut broadcaster, "Jazz FM");
        send(&mut hub, &broadcaster, Message::Listen);
        assert_eq!(error_code(&broadcaster.drain()), Some(ErrorCode::RoleConflict));

        send(&mut hub, &listener, Message::Listen);
        listener.drain();
        send(
            &mut hub,
            &listener,
            Message::BroadcastStart {
                broadcast_info: BroadcastInfo::named("Rock FM"),
            },
        );
        assert_eq!(error_code(&listener.drain()), Some(ErrorCode::RoleConflict));
        assert_eq!(hub.directory().len(), 1);
    }

    #[test]
    fn test_invalid_and_duplicate_broadcast() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);

        send(
            &mut hub,
            &broadcaster,
            Message::BroadcastStart {
                broadcast_info: BroadcastInfo::named("   "),
            },
        );
        assert_eq!(error_code(&broadcaster.drain()), Some(ErrorCode::InvalidName));
        assert!(hub.directory().is_empty());

        start(&mut hub, &mut broadcaster, "Jazz FM");
        send(
            &mut hub,
            &broadcaster,
            Message::BroadcastStart {
                broadcast_info: BroadcastInfo::named("Jazz FM 2"),
            },
        );
        assert_eq!(
            error_code(&broadcaster.drain()),
            Some(ErrorCode::AlreadyBroadcasting)
        );
        assert_eq!(hub.directory().len(), 1);
    }

    #[test]
    fn test_broadcast_end_with_foreign_id_ignored() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        send(
            &mut hub,
            &broadcaster,
            Message::BroadcastEnd {
                broadcast_id: BroadcastId::new("someone-else"),
            },
        );
        assert_eq!(hub.directory().len(), 1);

        send(&mut hub, &broadcaster, Message::BroadcastEnd { broadcast_id });
        assert!(hub.directory().is_empty());
    }

    #[test]
    fn test_broadcast_end_with_client_id() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        send(
            &mut hub,
            &broadcaster,
            Message::BroadcastStart {
                broadcast_info: BroadcastInfo {
                    id: Some(BroadcastId::new("client-uuid-1")),
                    name: "Jazz FM".into(),
                    start_time: Some(1_700_000_000_000),
                },
            },
        );
        let server_id = match broadcaster.drain().as_slice() {
            [Message::BroadcastStarted { broadcast_id, .. }] => broadcast_id.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(server_id, BroadcastId::new("client-uuid-1"));
        let pairing_id = join(&mut hub, &mut listener, &mut broadcaster, &server_id);

        send(
            &mut hub,
            &broadcaster,
            Message::BroadcastEnd {
                broadcast_id: BroadcastId::new("client-uuid-1"),
            },
        );

        assert!(hub.directory().is_empty());
        assert!(hub.router().is_empty());
        assert!(listener
            .drain()
            .contains(&Message::PairingClosed { pairing_id }));
    }

    #[test]
    fn test_broadcaster_role_released_without_broadcast() {
        let mut hub = hub();
        let mut conn = open(&mut hub, 1);

        let broadcast_id = start(&mut hub, &mut conn, "Jazz FM");
        send(&mut hub, &conn, Message::BroadcastEnd { broadcast_id });
        assert_eq!(hub.role(1), Some(ConnectionRole::Unassigned));

        send(&mut hub, &conn, Message::Listen);
        assert_eq!(
            conn.drain(),
            vec![Message::BroadcastList {
                broadcasts: Vec::new()
            }]
        );
        assert_eq!(hub.role(1), Some(ConnectionRole::Listener));

        // a rejected start does not pin the role either
        let mut other = open(&mut hub, 2);
        send(
            &mut hub,
            &other,
            Message::BroadcastStart {
                broadcast_info: BroadcastInfo::named("  "),
            },
        );
        assert_eq!(error_code(&other.drain()), Some(ErrorCode::InvalidName));
        assert_eq!(hub.role(2), Some(ConnectionRole::Unassigned));

        send(&mut hub, &other, Message::Listen);
        assert!(matches!(
            other.drain().as_slice(),
            [Message::BroadcastList { .. }]
        ));
    }

    #[test]
    fn test_slow_listener_keeps_only_latest_directory() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut watcher = open(&mut hub, 2);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        send(&mut hub, &watcher, Message::Listen);
        for i in 0..10 {
            let mut listener = open(&mut hub, 10 + i);
            join(&mut hub, &mut listener, &mut broadcaster, &broadcast_id);
            hub.on_tick(Instant::now());
        }

        match watcher.drain().as_slice() {
            [Message::BroadcastList { broadcasts }] => {
                assert_eq!(broadcasts[0].listener_count, 10)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_full_outbound_queue_drops_connection() {
        let (mut hub, _stats) = Hub::new(ServerConfig::default().outbound_queue_capacity(2));
        let mut stranger = open(&mut hub, 1);

        for _ in 0..3 {
            send(
                &mut hub,
                &stranger,
                Message::Answer {
                    pairing_id: PairingId::new("nope"),
                    sdp: "x".into(),
                },
            );
        }

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.stats().active_connections, 0);
        assert_eq!(stranger.drain().len(), 2);
        assert!(stranger.inbox.messages.try_recv().is_err());

        // the task's own Closed event arrives later and is a no-op
        hub.handle(HubEvent::Closed { id: 1 });
        assert_eq!(hub.stats().active_connections, 0);
    }

    #[test]
    fn test_broadcast_full() {
        let (mut hub, _stats) = Hub::new(ServerConfig::default().max_listeners_per_broadcast(1));
        let mut broadcaster = open(&mut hub, 1);
        let mut first = open(&mut hub, 2);
        let mut second = open(&mut hub, 3);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        join(&mut hub, &mut first, &mut broadcaster, &broadcast_id);

        send(
            &mut hub,
            &second,
            Message::ConnectRequest {
                broadcast_id: broadcast_id.clone(),
            },
        );
        assert_eq!(error_code(&second.drain()), Some(ErrorCode::BroadcastFull));
        assert_eq!(hub.router().len(), 1);
    }

    #[test]
    fn test_server_only_message_rejected() {
        let mut hub = hub();
        let mut conn = open(&mut hub, 1);

        send(
            &mut hub,
            &conn,
            Message::PairingClosed {
                pairing_id: PairingId::new("p"),
            },
        );
        assert_eq!(error_code(&conn.drain()), Some(ErrorCode::MalformedMessage));
        assert_eq!(hub.role(1), Some(ConnectionRole::Unassigned));
    }

    #[test]
    fn test_listener_count_change_pushes_directory() {
        let mut hub = hub();
        let mut broadcaster = open(&mut hub, 1);
        let mut watcher = open(&mut hub, 2);
        let mut listener = open(&mut hub, 3);

        let broadcast_id = start(&mut hub, &mut broadcaster, "Jazz FM");
        send(&mut hub, &watcher, Message::Listen);
        watcher.drain();

        join(&mut hub, &mut listener, &mut broadcaster, &broadcast_id);

        match watcher.drain().as_slice() {
            [Message::BroadcastList { broadcasts }] => {
                assert_eq!(broadcasts[0].listener_count, 1)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tick_pushes_and_publishes_stats() {
        let (mut hub, stats) = Hub::new(ServerConfig::default());
        let mut broadcaster = open(&mut hub, 1);
        let mut listener = open(&mut hub, 2);

        start(&mut hub, &mut broadcaster, "Jazz FM");
        send(&mut hub, &listener, Message::Listen);
        listener.drain();

        hub.on_tick(Instant::now());

        assert!(matches!(
            listener.drain().as_slice(),
            [Message::BroadcastList { .. }]
        ));
        assert!(broadcaster.drain().is_empty());

        let published = stats.borrow().clone();
        assert_eq!(published.active_connections, 2);
        assert_eq!(published.active_broadcasts, 1);
    }

    #[test]
    fn test_close_unknown_connection_is_noop() {
        let mut hub = hub();
        hub.handle(HubEvent::Closed { id: 42 });
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_run_stops_when_senders_dropped() {
        let (hub, _stats) = Hub::new(ServerConfig::default());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(hub.run(rx));

        let (out_tx, mut inbox) = outbound(8);
        tx.send(HubEvent::Opened {
            id: 1,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            tx: out_tx,
        })
        .await
        .unwrap();
        tx.send(HubEvent::Received {
            id: 1,
            message: Message::Listen,
        })
        .await
        .unwrap();

        inbox.directory.changed().await.unwrap();
        assert!(inbox.directory.borrow_and_update().is_empty());

        drop(tx);
        tokio_test::assert_ok!(task.await);
    }
}
