//! Agent side of the tether protocol.
//!
//! The agent has no inbound reachability. It dials the relay, registers a
//! stable identity, heartbeats on a fixed interval, and serves
//! `download_request` commands by streaming the file back as ordered chunks.
//! When the connection drops it waits per its [`ReconnectPolicy`] and dials
//! again, forever.

pub mod backoff;
pub mod client;
pub mod responder;

pub use backoff::ReconnectPolicy;
pub use client::AgentClient;
pub use responder::{TransferJob, TransferResponder};
