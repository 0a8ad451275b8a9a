//! Broadcast directory implementation
//!
//! The registry of live broadcasts. Owned by the server hub and mutated only
//! from its event loop, so every operation is synchronous.

use std::collections::HashMap;

use crate::protocol::{BroadcastId, BroadcastSummary};

use super::entry::{Broadcast, ConnectionId};
use super::error::DirectoryError;

/// Registry of active broadcasts, keyed by broadcast id
#[derive(Debug, Default)]
pub struct Directory {
    /// Map of broadcast id to broadcast
    broadcasts: HashMap<BroadcastId, Broadcast>,

    /// Owning connection to its broadcast (one per connection)
    owners: HashMap<ConnectionId, BroadcastId>,

    /// Next registration sequence number
    next_seq: u64,

    /// Set whenever the directory changes, cleared by `take_changed`
    changed: bool,
}

impl Directory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a broadcast owned by `owner`
    ///
    /// The name is trimmed and must be non-empty. A connection may own at
    /// most one broadcast.
    pub fn register(
        &mut self,
        owner: ConnectionId,
        name: &str,
    ) -> Result<BroadcastId, DirectoryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DirectoryError::InvalidName);
        }

        if let Some(existing) = self.owners.get(&owner) {
            return Err(DirectoryError::AlreadyBroadcasting(existing.clone()));
        }

        let mut id = BroadcastId::generate();
        while self.broadcasts.contains_key(&id) {
            id = BroadcastId::generate();
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.broadcasts.insert(
            id.clone(),
            Broadcast::new(id.clone(), name.to_string(), owner, seq),
        );
        self.owners.insert(owner, id.clone());
        self.changed = true;

        tracing::info!(
            broadcast = %id,
            connection_id = owner,
            name = name,
            "Broadcast registered"
        );

        Ok(id)
    }

    /// Remove the broadcast owned by `owner`, if any
    ///
    /// Idempotent. Returns the removed broadcast so the caller can tear down
    /// its pairings.
    pub fn unregister(&mut self, owner: ConnectionId) -> Option<Broadcast> {
        let id = self.owners.remove(&owner)?;
        let broadcast = self.broadcasts.remove(&id)?;
        self.changed = true;

        tracing::info!(
            broadcast = %id,
            connection_id = owner,
            listeners = broadcast.listener_count,
            on_air_secs = broadcast.on_air().as_secs(),
            "Broadcast unregistered"
        );

        Some(broadcast)
    }

    /// Current directory contents, ordered by registration time
    pub fn snapshot(&self) -> Vec<BroadcastSummary> {
        let mut entries: Vec<&Broadcast> = self.broadcasts.values().collect();
        entries.sort_by_key(|b| b.seq);
        entries.into_iter().map(Broadcast::summary).collect()
    }

    /// Apply `delta` to a broadcast's listener count
    ///
    /// No-op if the broadcast is gone; teardown can race a pending adjustment.
    pub fn adjust_listener_count(&mut self, id: &BroadcastId, delta: i32) {
        if let Some(broadcast) = self.broadcasts.get_mut(id) {
            broadcast.adjust_listeners(delta);
            self.changed = true;

            tracing::debug!(
                broadcast = %id,
                listeners = broadcast.listener_count,
                "Listener count adjusted"
            );
        }
    }

    /// Look up a broadcast
    pub fn get(&self, id: &BroadcastId) -> Option<&Broadcast> {
        self.broadcasts.get(id)
    }

    /// Look up a broadcast, failing with `BroadcastNotFound`
    pub fn require(&self, id: &BroadcastId) -> Result<&Broadcast, DirectoryError> {
        self.broadcasts
            .get(id)
            .ok_or_else(|| DirectoryError::BroadcastNotFound(id.clone()))
    }

    /// Broadcast owned by a connection
    pub fn owned_by(&self, owner: ConnectionId) -> Option<&Broadcast> {
        self.owners
            .get(&owner)
            .and_then(|id| self.broadcasts.get(id))
    }

    /// Drop broadcasts whose owning connection is no longer alive
    pub fn prune<F>(&mut self, is_alive: F) -> Vec<Broadcast>
    where
        F: Fn(ConnectionId) -> bool,
    {
        let dead: Vec<ConnectionId> = self
            .owners
            .keys()
            .copied()
            .filter(|owner| !is_alive(*owner))
            .collect();

        let removed: Vec<Broadcast> = dead
            .into_iter()
            .filter_map(|owner| self.unregister(owner))
            .collect();

        if !removed.is_empty() {
            tracing::warn!(count = removed.len(), "Pruned broadcasts with dead owners");
        }

        removed
    }

    /// Number of live broadcasts
    pub fn len(&self) -> usize {
        self.broadcasts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty()
    }

    /// Return and clear the directory-changed flag
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}
