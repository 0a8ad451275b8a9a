//! Crate error type

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::directory::DirectoryError;
use crate::protocol::{CodecError, ErrorCode};
use crate::router::RouteError;

/// Error type for server and client operations
#[derive(Debug)]
pub enum Error {
    /// Socket error
    Io(std::io::Error),
    /// Websocket protocol error
    WebSocket(tungstenite::Error),
    /// Frame could not be encoded or decoded
    Codec(CodecError),
    /// Websocket upgrade did not finish in time
    HandshakeTimeout(Duration),
    Directory(DirectoryError),
    Route(RouteError),
    /// Signaling server could not be reached after `attempts` tries
    TransportUnreachable { attempts: u32 },
    /// The other end of an internal channel is gone
    ChannelClosed,
}

impl Error {
    /// Wire code, for errors a client should see
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Codec(_) => Some(ErrorCode::MalformedMessage),
            Error::Directory(e) => Some(e.code()),
            Error::Route(e) => Some(e.code()),
            Error::TransportUnreachable { .. } => Some(ErrorCode::TransportUnreachable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Codec(e) => write!(f, "{}", e),
            Error::HandshakeTimeout(timeout) => {
                write!(f, "Handshake not completed within {:?}", timeout)
            }
            Error::Directory(e) => write!(f, "{}", e),
            Error::Route(e) => write!(f, "{}", e),
            Error::TransportUnreachable { attempts } => {
                write!(f, "Signaling server unreachable after {} attempts", attempts)
            }
            Error::ChannelClosed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::WebSocket(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Directory(e) => Some(e),
            Error::Route(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<DirectoryError> for Error {
    fn from(e: DirectoryError) -> Self {
        Error::Directory(e)
    }
}

impl From<RouteError> for Error {
    fn from(e: RouteError) -> Self {
        Error::Route(e)
    }
}

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;
