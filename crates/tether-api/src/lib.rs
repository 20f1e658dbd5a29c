//! HTTP API for the tether relay.
//!
//! Callers trigger downloads and inspect agents here; the agent-facing
//! WebSocket listener lives in `tether-wire`.

pub mod downloads;
pub mod routes;
pub mod server;

pub use downloads::DownloadStore;
pub use routes::AppState;
pub use server::{build_router, serve};
