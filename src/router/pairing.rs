//! Pairing between one broadcaster and one listener

use std::time::Instant;

use crate::directory::ConnectionId;
use crate::protocol::{BroadcastId, Message, PairingId};

/// Negotiation relationship between a broadcaster and one of its listeners
#[derive(Debug, Clone)]
pub struct Pairing {
    /// Router-assigned identifier, carried on every negotiation message
    pub id: PairingId,

    /// Broadcast the listener asked for
    pub broadcast_id: BroadcastId,

    /// Connection hosting the broadcast
    pub broadcaster: ConnectionId,

    /// Connection that issued the connect request
    pub listener: ConnectionId,

    /// When the pairing was created
    pub created_at: Instant,

    /// Messages relayed in either direction
    pub relayed: u64,
}

impl Pairing {
    pub(super) fn new(
        broadcast_id: BroadcastId,
        broadcaster: ConnectionId,
        listener: ConnectionId,
    ) -> Self {
        Self {
            id: PairingId::generate(),
            broadcast_id,
            broadcaster,
            listener,
            created_at: Instant::now(),
            relayed: 0,
        }
    }

    /// The other end of the pairing, if `from` is one of its ends
    pub fn counterpart(&self, from: ConnectionId) -> Option<ConnectionId> {
        if from == self.broadcaster {
            Some(self.listener)
        } else if from == self.listener {
            Some(self.broadcaster)
        } else {
            None
        }
    }

    /// Whether `connection` is either end of this pairing
    pub fn involves(&self, connection: ConnectionId) -> bool {
        self.broadcaster == connection || self.listener == connection
    }
}

/// A message addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub message: Message,
}

impl Delivery {
    pub fn new(to: ConnectionId, message: Message) -> Self {
        Self { to, message }
    }
}
