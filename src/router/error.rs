//! Router error types

use crate::protocol::{BroadcastId, ErrorCode, PairingId};

/// Error type for routing operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Target broadcast is not in the directory
    BroadcastNotFound(BroadcastId),
    /// Target broadcast reached its listener limit
    BroadcastFull { broadcast: BroadcastId, limit: u32 },
    /// Pairing does not exist, or the sender is not one of its ends
    ///
    /// Expected after teardown races; callers log and drop it.
    UnknownPairing(PairingId),
}

impl RouteError {
    /// Wire code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            RouteError::BroadcastNotFound(_) => ErrorCode::BroadcastNotFound,
            RouteError::BroadcastFull { .. } => ErrorCode::BroadcastFull,
            RouteError::UnknownPairing(_) => ErrorCode::UnknownPairing,
        }
    }
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::BroadcastNotFound(id) => write!(f, "Broadcast not found: {}", id),
            RouteError::BroadcastFull { broadcast, limit } => {
                write!(f, "Broadcast {} is full ({} listeners)", broadcast, limit)
            }
            RouteError::UnknownPairing(id) => write!(f, "Unknown pairing: {}", id),
        }
    }
}

impl std::error::Error for RouteError {}

