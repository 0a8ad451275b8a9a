//! Session router implementation
//!
//! Maps each negotiation message to the other end of its pairing. The router
//! never looks inside `sdp` or `candidate` payloads; it only routes by
//! pairing id.

use std::collections::{HashMap, HashSet};

use crate::directory::{ConnectionId, Directory};
use crate::protocol::{BroadcastId, Message, PairingId};

use super::error::RouteError;
use super::pairing::{Delivery, Pairing};

/// Table of active pairings
#[derive(Debug, Default)]
pub struct Router {
    /// Map of pairing id to pairing
    pairings: HashMap<PairingId, Pairing>,

    /// Pairings each connection takes part in, either end
    by_connection: HashMap<ConnectionId, HashSet<PairingId>>,

    /// Pairings derived from each broadcast
    by_broadcast: HashMap<BroadcastId, HashSet<PairingId>>,

    /// Listener limit per broadcast (0 = unlimited)
    max_listeners: u32,
}

impl Router {
    /// Create a router with no listener limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a router that caps listeners per broadcast
    pub fn with_max_listeners(max_listeners: u32) -> Self {
        Self {
            max_listeners,
            ..Default::default()
        }
    }

    /// Pair `listener` with the broadcast `broadcast_id`
    ///
    /// Increments the broadcast's listener count and returns the new pairing
    /// id with the two notifications to deliver: `connect-accepted` to the
    /// listener and `listener-joined` to the broadcaster.
    pub fn request_connect(
        &mut self,
        directory: &mut Directory,
        listener: ConnectionId,
        broadcast_id: &BroadcastId,
    ) -> Result<(PairingId, Vec<Delivery>), RouteError> {
        let broadcast = directory
            .require(broadcast_id)
            .map_err(|_| RouteError::BroadcastNotFound(broadcast_id.clone()))?;

        if self.max_listeners > 0 && broadcast.listener_count >= self.max_listeners {
            return Err(RouteError::BroadcastFull {
                broadcast: broadcast_id.clone(),
                limit: self.max_listeners,
            });
        }

        let broadcaster = broadcast.owner;
        let mut pairing = Pairing::new(broadcast_id.clone(), broadcaster, listener);
        while self.pairings.contains_key(&pairing.id) {
            pairing.id = PairingId::generate();
        }
        let pairing_id = pairing.id.clone();

        self.index(broadcaster, &pairing_id);
        self.index(listener, &pairing_id);
        self.by_broadcast
            .entry(broadcast_id.clone())
            .or_default()
            .insert(pairing_id.clone());
        self.pairings.insert(pairing_id.clone(), pairing);
        directory.adjust_listener_count(broadcast_id, 1);

        tracing::info!(
            pairing = %pairing_id,
            broadcast = %broadcast_id,
            broadcaster = broadcaster,
            listener = listener,
            "Pairing created"
        );

        let deliveries = vec![
            Delivery::new(
                listener,
                Message::ConnectAccepted {
                    pairing_id: pairing_id.clone(),
                    broadcast_id: broadcast_id.clone(),
                },
            ),
            Delivery::new(
                broadcaster,
                Message::ListenerJoined {
                    pairing_id: pairing_id.clone(),
                    broadcast_id: broadcast_id.clone(),
                },
            ),
        ];

        Ok((pairing_id, deliveries))
    }

    /// Forward `message` from `from` to the other end of `pairing_id`
    ///
    /// The message is passed through unmodified.
    pub fn relay(
        &mut self,
        pairing_id: &PairingId,
        from: ConnectionId,
        message: Message,
    ) -> Result<Delivery, RouteError> {
        let pairing = self
            .pairings
            .get_mut(pairing_id)
            .ok_or_else(|| RouteError::UnknownPairing(pairing_id.clone()))?;

        let to = pairing
            .counterpart(from)
            .ok_or_else(|| RouteError::UnknownPairing(pairing_id.clone()))?;

        pairing.relayed += 1;

        tracing::debug!(
            pairing = %pairing_id,
            from = from,
            to = to,
            kind = message.kind(),
            "Relaying negotiation message"
        );

        Ok(Delivery::new(to, message))
    }

    /// Close a pairing and decrement its broadcast's listener count
    ///
    /// Idempotent; returns `None` if the pairing was already gone.
    pub fn teardown(&mut self, directory: &mut Directory, pairing_id: &PairingId) -> Option<Pairing> {
        let pairing = self.pairings.remove(pairing_id)?;

        self.unindex(pairing.broadcaster, pairing_id);
        self.unindex(pairing.listener, pairing_id);
        if let Some(set) = self.by_broadcast.get_mut(&pairing.broadcast_id) {
            set.remove(pairing_id);
            if set.is_empty() {
                self.by_broadcast.remove(&pairing.broadcast_id);
            }
        }
        directory.adjust_listener_count(&pairing.broadcast_id, -1);

        tracing::info!(
            pairing = %pairing_id,
            broadcast = %pairing.broadcast_id,
            relayed = pairing.relayed,
            age_ms = pairing.created_at.elapsed().as_millis() as u64,
            "Pairing closed"
        );

        Some(pairing)
    }

    /// Close every pairing a connection takes part in
    pub fn teardown_connection(
        &mut self,
        directory: &mut Directory,
        connection: ConnectionId,
    ) -> Vec<Pairing> {
        let ids: Vec<PairingId> = self
            .by_connection
            .get(&connection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        ids.iter()
            .filter_map(|id| self.teardown(directory, id))
            .collect()
    }

    /// Close every pairing derived from a broadcast
    pub fn teardown_broadcast(
        &mut self,
        directory: &mut Directory,
        broadcast_id: &BroadcastId,
    ) -> Vec<Pairing> {
        let ids: Vec<PairingId> = self
            .by_broadcast
            .get(broadcast_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        ids.iter()
            .filter_map(|id| self.teardown(directory, id))
            .collect()
    }

    /// Look up a pairing
    pub fn get(&self, pairing_id: &PairingId) -> Option<&Pairing> {
        self.pairings.get(pairing_id)
    }

    /// Pairings a connection takes part in
    pub fn pairings_of(&self, connection: ConnectionId) -> Vec<&Pairing> {
        self.by_connection
            .get(&connection)
            .map(|set| set.iter().filter_map(|id| self.pairings.get(id)).collect())
            .unwrap_or_default()
    }

    /// Number of active pairings on one broadcast
    pub fn pairings_of_broadcast(&self, broadcast_id: &BroadcastId) -> usize {
        self.by_broadcast.get(broadcast_id).map_or(0, |set| set.len())
    }

    /// Number of active pairings
    pub fn len(&self) -> usize {
        self.pairings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairings.is_empty()
    }

    fn index(&mut self, connection: ConnectionId, pairing_id: &PairingId) {
        self.by_connection
            .entry(connection)
            .or_default()
            .insert(pairing_id.clone());
    }

    fn unindex(&mut self, connection: ConnectionId, pairing_id: &PairingId) {
        if let Some(set) = self.by_connection.get_mut(&connection) {
            set.remove(pairing_id);
            if set.is_empty() {
                self.by_connection.remove(&connection);
            }
        }
    }
}
