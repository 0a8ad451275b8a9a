//! Directory error types

use crate::protocol::{BroadcastId, ErrorCode};

/// Error type for directory operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Broadcast name is empty after trimming
    InvalidName,
    /// Connection already owns a broadcast
    AlreadyBroadcasting(BroadcastId),
    /// Broadcast not found
    BroadcastNotFound(BroadcastId),
}

impl DirectoryError {
    /// Wire code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            DirectoryError::InvalidName => ErrorCode::InvalidName,
            DirectoryError::AlreadyBroadcasting(_) => ErrorCode::AlreadyBroadcasting,
            DirectoryError::BroadcastNotFound(_) => ErrorCode::BroadcastNotFound,
        }
    }
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::InvalidName => write!(f, "Broadcast name must not be empty"),
            DirectoryError::AlreadyBroadcasting(id) => {
                write!(f, "Connection is already broadcasting: {}", id)
            }
            DirectoryError::BroadcastNotFound(id) => write!(f, "Broadcast not found: {}", id),
        }
    }
}

impl std::error::Error for DirectoryError {}
