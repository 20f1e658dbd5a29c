//! Shared error types for tether.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for relay and agent operations.
#[derive(Error, Debug)]
pub enum TetherError {
    /// The agent id has never registered with this relay.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The agent is known but its connection is currently down.
    #[error("Agent is not connected: {0}")]
    AgentNotConnected(String),

    /// The agent reported that it could not complete the transfer.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// No completion arrived within the request window.
    #[error("Transfer {request_id} timed out after {}s", timeout.as_secs())]
    TransferTimeout {
        /// The request that expired.
        request_id: String,
        /// The window that elapsed.
        timeout: Duration,
    },

    /// The agent reported success but chunks are missing.
    #[error("Transfer {request_id} is incomplete: {missing} chunks missing, first {first_missing:?}")]
    IncompleteTransfer {
        /// The request whose stream had gaps.
        request_id: String,
        /// How many chunk indices never arrived.
        missing: u64,
        /// The lowest of those indices; a short prefix, not the full set.
        first_missing: Vec<u64>,
    },

    /// Agent-local: the requested file does not exist.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Agent-local: the file exists but could not be read.
    #[error("File read error: {0}")]
    FileReadError(String),

    /// The connection dropped while a message was being sent.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with TetherError.
pub type TetherResult<T> = Result<T, TetherError>;
