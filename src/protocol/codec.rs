//! Websocket frame codec
//!
//! One JSON message per websocket frame. Text frames are the normal case;
//! binary frames are accepted when they hold UTF-8 JSON.

use tokio_tungstenite::tungstenite::Message as Frame;

use super::message::Message;

/// Default maximum frame payload accepted from a peer
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Error decoding or encoding a signaling frame
#[derive(Debug)]
pub enum CodecError {
    /// Payload was not a valid message
    Json(serde_json::Error),
    /// Frame exceeded the configured size limit
    TooLarge { size: usize, max: usize },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "Malformed message: {}", e),
            CodecError::TooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Json(e) => Some(e),
            CodecError::TooLarge { .. } => None,
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e)
    }
}

/// Serialize a message to its JSON text
pub fn encode(message: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse a message from raw JSON bytes
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    Ok(serde_json::from_slice(data)?)
}

/// Wrap a message in a websocket text frame
pub fn to_frame(message: &Message) -> Result<Frame, CodecError> {
    Ok(Frame::text(encode(message)?))
}

/// Extract a message from a websocket frame
///
/// Returns `Ok(None)` for control frames (ping, pong, close), which carry no
/// signaling message.
pub fn from_frame(frame: &Frame, max_size: usize) -> Result<Option<Message>, CodecError> {
    let data: &[u8] = match frame {
        Frame::Text(text) => text.as_bytes(),
        Frame::Binary(data) => &data[..],
        _ => return Ok(None),
    };

    if max_size > 0 && data.len() > max_size {
        return Err(CodecError::TooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    decode(data).map(Some)
}
