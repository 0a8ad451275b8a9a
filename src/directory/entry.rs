//! Broadcast entry
//!
//! Per-broadcast state stored in the directory.

use std::time::{Instant, SystemTime};

use crate::protocol::{unix_millis, BroadcastId, BroadcastSummary};

/// Opaque identifier of one transport connection on the server
pub type ConnectionId = u64;

/// A live broadcast in the directory
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Directory-assigned identifier
    pub id: BroadcastId,

    /// Display name (trimmed, non-empty)
    pub name: String,

    /// Connection that owns this broadcast
    ///
    /// Looked up by id in the active-connections table, never dereferenced.
    pub owner: ConnectionId,

    /// Wall-clock start time, reported to listeners
    pub started_at: SystemTime,

    /// Monotonic start time, for on-air duration
    pub created_at: Instant,

    /// Number of listeners currently paired
    pub listener_count: u32,

    /// Registration order
    pub(super) seq: u64,
}

impl Broadcast {
    pub(super) fn new(id: BroadcastId, name: String, owner: ConnectionId, seq: u64) -> Self {
        Self {
            id,
            name,
            owner,
            started_at: SystemTime::now(),
            created_at: Instant::now(),
            listener_count: 0,
            seq,
        }
    }

    /// Start time as Unix milliseconds
    pub fn start_time_ms(&self) -> u64 {
        unix_millis(self.started_at)
    }

    /// How long this broadcast has been on air
    pub fn on_air(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Apply a signed delta to the listener count, clamped at zero
    pub(super) fn adjust_listeners(&mut self, delta: i32) {
        self.listener_count = if delta >= 0 {
            self.listener_count.saturating_add(delta as u32)
        } else {
            self.listener_count.saturating_sub(delta.unsigned_abs())
        };
    }

    /// Wire representation for directory pushes
    pub fn summary(&self) -> BroadcastSummary {
        BroadcastSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            listener_count: self.listener_count,
            start_time: self.start_time_ms(),
        }
    }
}
