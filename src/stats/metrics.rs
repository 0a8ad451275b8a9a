//! Statistics for the signaling server

use std::time::{Duration, Instant};

use crate::protocol::format_duration;

/// Server-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Total connections ever
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Broadcasts in the directory
    pub active_broadcasts: u64,
    /// Open pairings
    pub active_pairings: u64,
    /// Negotiation messages relayed
    pub messages_relayed: u64,
    /// Negotiation messages dropped for an unknown pairing
    pub relay_misses: u64,
    /// Directory snapshots pushed
    pub directory_pushes: u64,
    /// Uptime
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the current figures as one log line
    pub fn log(&self) {
        tracing::info!(
            connections = self.active_connections,
            total_connections = self.total_connections,
            broadcasts = self.active_broadcasts,
            pairings = self.active_pairings,
            relayed = self.messages_relayed,
            relay_misses = self.relay_misses,
            uptime = %format_duration(self.uptime),
            "Server stats"
        );
    }
}

/// Counter set owned by the hub
#[derive(Debug)]
pub struct StatsRecorder {
    started_at: Instant,
    stats: ServerStats,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            stats: ServerStats::new(),
        }
    }

    pub fn connection_opened(&mut self) {
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;
    }

    pub fn connection_closed(&mut self) {
        self.stats.active_connections = self.stats.active_connections.saturating_sub(1);
    }

    pub fn relayed(&mut self) {
        self.stats.messages_relayed += 1;
    }

    pub fn relay_missed(&mut self) {
        self.stats.relay_misses += 1;
    }

    pub fn directory_pushed(&mut self) {
        self.stats.directory_pushes += 1;
    }

    /// Current figures, with the gauges sampled by the caller
    pub fn snapshot(&self, broadcasts: usize, pairings: usize) -> ServerStats {
        ServerStats {
            active_broadcasts: broadcasts as u64,
            active_pairings: pairings as u64,
            uptime: self.started_at.elapsed(),
            ..self.stats.clone()
        }
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
