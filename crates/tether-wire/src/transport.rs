//! WebSocket framing for envelopes.
//!
//! One envelope travels as one JSON text frame. Control and binary frames
//! carry no protocol meaning and are skipped by both ends.

use tether_types::message::{decode_envelope, encode_envelope, MAX_FRAME_SIZE};
use tether_types::Envelope;
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection closed")]
    ConnectionClosed,
}

/// What a received frame means to the protocol.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded envelope.
    Envelope(Envelope),
    /// The peer closed the connection.
    Closed,
    /// A frame with no protocol meaning (ping, pong, binary).
    Ignored,
}

/// Socket limits shared by relay and agent, sized so a full chunk fits one
/// frame.
pub fn socket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_frame_size = Some(MAX_FRAME_SIZE);
    config.max_message_size = Some(MAX_FRAME_SIZE);
    config
}

/// Wrap an envelope in a text frame.
pub fn to_frame(envelope: &Envelope) -> Result<Message, WireError> {
    Ok(Message::Text(encode_envelope(envelope)?))
}

/// Interpret a received frame. Malformed JSON surfaces as `WireError::Json`
/// so the caller can log and drop it without ending the session.
pub fn parse_frame(frame: Message) -> Result<Inbound, WireError> {
    match frame {
        Message::Text(text) => Ok(Inbound::Envelope(decode_envelope(&text)?)),
        Message::Close(_) => Ok(Inbound::Closed),
        _ => Ok(Inbound::Ignored),
    }
}
