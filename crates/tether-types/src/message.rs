//! Wire envelope types.
//!
//! Every message exchanged between a relay and an agent is a single JSON
//! object whose `type` field selects the variant. Field names are camelCase
//! on the wire. File bytes travel as standard base64 inside `file_chunk`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest raw chunk an agent sends or a relay asks for.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Frame and message limit both ends configure on their WebSocket.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes of JSON around a chunk's base64 payload, with room to spare.
const CHUNK_ENVELOPE_OVERHEAD: usize = 64 * 1024;

// A full-size chunk must fit one frame once base64-encoded.
const _: () = assert!(MAX_CHUNK_SIZE.div_ceil(3) * 4 + CHUNK_ENVELOPE_OVERHEAD <= MAX_FRAME_SIZE);

/// Identifier minted by the relay for one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Mint a fresh random request id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single message on the agent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Agent announces (or re-announces) its identity.
    #[serde(rename_all = "camelCase")]
    Register {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_name: Option<String>,
    },
    /// Relay acknowledges a registration.
    #[serde(rename_all = "camelCase")]
    Registered { client_id: String, message: String },
    /// Periodic liveness ping from the agent.
    #[serde(rename_all = "camelCase")]
    Heartbeat { client_id: String },
    /// Relay acknowledges a heartbeat from a known agent.
    HeartbeatAck,
    /// Relay asks the agent to stream a local file.
    #[serde(rename_all = "camelCase")]
    DownloadRequest {
        request_id: RequestId,
        file_path: String,
        chunk_size: usize,
    },
    /// One slice of the requested file, base64-encoded.
    #[serde(rename_all = "camelCase")]
    FileChunk {
        request_id: RequestId,
        chunk: String,
        chunk_index: u64,
    },
    /// End of a chunk stream.
    #[serde(rename_all = "camelCase")]
    FileComplete {
        request_id: RequestId,
        success: bool,
        #[serde(default)]
        message: String,
        /// Number of chunks the agent sent. Absent from older agents.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u64>,
    },
    /// The agent could not serve a request.
    #[serde(rename_all = "camelCase")]
    Error {
        request_id: RequestId,
        message: String,
    },
}

impl Envelope {
    /// The wire discriminator for this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::Registered { .. } => "registered",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::HeartbeatAck => "heartbeat_ack",
            Envelope::DownloadRequest { .. } => "download_request",
            Envelope::FileChunk { .. } => "file_chunk",
            Envelope::FileComplete { .. } => "file_complete",
            Envelope::Error { .. } => "error",
        }
    }

    /// The request this envelope belongs to, if it is transfer traffic.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Envelope::DownloadRequest { request_id, .. }
            | Envelope::FileChunk { request_id, .. }
            | Envelope::FileComplete { request_id, .. }
            | Envelope::Error { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// Serialize an envelope to its JSON text frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parse a JSON text frame into an envelope.
pub fn decode_envelope(text: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encode raw chunk bytes to their text-safe wire form.
pub fn encode_chunk(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a wire chunk back to raw bytes.
pub fn decode_chunk(chunk: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(chunk)
}

/// Display name used when an agent registers without one.
pub fn default_agent_name(agent_id: &str) -> String {
    let prefix: String = agent_id.chars().take(8).collect();
    format!("Agent-{prefix}")
}
