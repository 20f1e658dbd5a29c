//! Configuration for the relay and agent processes.
//!
//! Both sections deserialize from one TOML file. Every field has a default so
//! an empty or partial file is valid.

use crate::message::MAX_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub relay: RelayConfig,
    pub agent: AgentConfig,
}

/// Relay-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address of the HTTP API.
    pub http_listen: SocketAddr,
    /// Address agents connect to over WebSocket.
    pub agent_listen: SocketAddr,
    /// Directory completed downloads are written to.
    pub downloads_dir: PathBuf,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Chunk size requested when the caller does not pick one.
    pub default_chunk_size: usize,
    /// Forget agents that stayed disconnected this long. `None` keeps them.
    pub retention_secs: Option<u64>,
    /// How often the retention sweep runs.
    pub retention_sweep_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            agent_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            downloads_dir: PathBuf::from("downloads"),
            request_timeout_secs: 300,
            default_chunk_size: 1024 * 1024,
            retention_secs: None,
            retention_sweep_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

/// Agent-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL of the relay's agent listener.
    pub server_url: String,
    /// Stable identity. Generated once per process when absent.
    pub agent_id: Option<String>,
    /// Display name. Derived from the id when absent.
    pub name: Option<String>,
    pub heartbeat_interval_secs: u64,
    /// Reconnect after this many unacknowledged heartbeats. 0 disables.
    pub max_missed_heartbeats: u32,
    /// Upper bound on the chunk size the agent will honor. At most
    /// [`MAX_CHUNK_SIZE`].
    pub max_chunk_size: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            agent_id: None,
            name: None,
            heartbeat_interval_secs: 30,
            max_missed_heartbeats: 3,
            max_chunk_size: MAX_CHUNK_SIZE,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// How the agent spaces reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStrategy {
    /// Wait `delay_ms` between every attempt.
    #[default]
    Fixed,
    /// Double from `delay_ms` up to `max_delay_ms`.
    Exponential,
}

/// Reconnect settings. Attempts never stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub strategy: ReconnectStrategy,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Fixed,
            delay_ms: 5_000,
            max_delay_ms: 60_000,
        }
    }
}
