//! Signaling protocol
//!
//! This module provides:
//! - The closed message envelope exchanged between clients and the server
//! - Identifier newtypes for broadcasts and pairings
//! - Websocket frame encoding and decoding

pub mod codec;
pub mod message;

pub use codec::{CodecError, DEFAULT_MAX_MESSAGE_SIZE};
pub use message::{
    format_duration, unix_millis, BroadcastId, BroadcastInfo, BroadcastSummary, ErrorCode,
    Message, PairingId,
};
