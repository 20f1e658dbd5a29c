//! Agent registry: tracks attached agents and owns their connections.
//!
//! The [`AgentRegistry`] is the only component that holds connection handles.
//! Everything else reaches an agent through [`AgentRegistry::send`], so the
//! lifetime of a connection and the lifetime of a transfer request stay
//! independent of each other.
//!
//! Records are keyed by the id the agent chose at registration. A reconnect
//! under the same id swaps the connection handle in place; the record itself
//! is only removed by [`AgentRegistry::prune_disconnected`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tether_types::message::default_agent_name;
use tether_types::{Envelope, TetherError, TetherResult};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Process-unique id of one accepted connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of one agent connection.
///
/// Envelopes pushed here are drained by the connection's writer task. Once
/// that task is gone, sends fail.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Create a handle together with the receiver its writer should drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an envelope for the writer. Returns false if the writer is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Lifecycle notifications for registry observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// An agent registered. `reconnect` is true when the id was already known.
    Connected { agent_id: String, reconnect: bool },
    /// An agent's connection closed.
    Disconnected { agent_id: String },
    /// A long-disconnected agent was forgotten by the retention sweep.
    Pruned { agent_id: String },
}

/// A registered agent.
#[derive(Debug, Clone)]
struct AgentEntry {
    name: String,
    connection: ConnectionHandle,
    connected: bool,
    last_heartbeat: DateTime<Utc>,
    registered_at: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one agent, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub client_id: String,
    pub client_name: String,
    pub connected: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Thread-safe registry of every agent seen since startup.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentEntry>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl AgentRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to registration and disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Admit or re-admit an agent on `connection`, then acknowledge it.
    ///
    /// Re-registering a known id replaces its connection handle and marks it
    /// connected; the stored name is kept. Returns true for a reconnect.
    pub fn register(
        &self,
        agent_id: &str,
        name: Option<&str>,
        connection: ConnectionHandle,
    ) -> bool {
        let now = Utc::now();
        let reconnect = {
            let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
            match agents.get_mut(agent_id) {
                Some(entry) => {
                    entry.connection = connection.clone();
                    entry.connected = true;
                    entry.disconnected_at = None;
                    info!(agent_id, name = %entry.name, "Agent reconnected");
                    true
                }
                None => {
                    let name = name
                        .filter(|n| !n.trim().is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| default_agent_name(agent_id));
                    info!(agent_id, name = %name, "New agent registered");
                    agents.insert(
                        agent_id.to_string(),
                        AgentEntry {
                            name,
                            connection: connection.clone(),
                            connected: true,
                            last_heartbeat: now,
                            registered_at: now,
                            disconnected_at: None,
                        },
                    );
                    false
                }
            }
        };

        let _ = self.events.send(RegistryEvent::Connected {
            agent_id: agent_id.to_string(),
            reconnect,
        });

        if !connection.send(Envelope::Registered {
            client_id: agent_id.to_string(),
            message: "Successfully registered with server".to_string(),
        }) {
            warn!(agent_id, "Connection closed before registration ack");
        }
        reconnect
    }

    /// Mark whichever agent currently owns `connection_id` as disconnected.
    ///
    /// A connection that was already superseded by a reconnect matches no
    /// agent, so closing it is a no-op. Returns the affected agent id.
    pub fn mark_disconnected(&self, connection_id: ConnectionId) -> Option<String> {
        let agent_id = {
            let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
            let (agent_id, entry) = agents
                .iter_mut()
                .find(|(_, e)| e.connection.id() == connection_id && e.connected)?;
            entry.connected = false;
            entry.disconnected_at = Some(Utc::now());
            agent_id.clone()
        };

        info!(agent_id = %agent_id, "Agent disconnected");
        let _ = self.events.send(RegistryEvent::Disconnected {
            agent_id: agent_id.clone(),
        });
        Some(agent_id)
    }

    /// Stamp a heartbeat and acknowledge it over the agent's connection.
    ///
    /// Unknown ids are ignored without a reply. Returns whether the agent
    /// was known.
    pub fn record_heartbeat(&self, agent_id: &str) -> bool {
        let connection = {
            let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
            match agents.get_mut(agent_id) {
                Some(entry) => {
                    entry.last_heartbeat = Utc::now();
                    entry.connection.clone()
                }
                None => {
                    debug!(agent_id, "Heartbeat from unknown agent ignored");
                    return false;
                }
            }
        };

        if !connection.send(Envelope::HeartbeatAck) {
            debug!(agent_id, "Heartbeat ack dropped, connection closed");
        }
        true
    }

    /// Check that an agent exists and is attached.
    pub fn ensure_connected(&self, agent_id: &str) -> TetherResult<()> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        match agents.get(agent_id) {
            None => Err(TetherError::AgentNotFound(agent_id.to_string())),
            Some(entry) if !entry.connected => {
                Err(TetherError::AgentNotConnected(agent_id.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Send an envelope to an agent. The only route from the relay to an agent.
    pub fn send(&self, agent_id: &str, envelope: Envelope) -> TetherResult<()> {
        let connection = {
            let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
            match agents.get(agent_id) {
                None => return Err(TetherError::AgentNotFound(agent_id.to_string())),
                Some(entry) if !entry.connected => {
                    return Err(TetherError::AgentNotConnected(agent_id.to_string()))
                }
                Some(entry) => entry.connection.clone(),
            }
        };

        if connection.send(envelope) {
            Ok(())
        } else {
            Err(TetherError::AgentNotConnected(agent_id.to_string()))
        }
    }

    /// Snapshot of every known agent, connected or not, ordered by id.
    pub fn list_agents(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<AgentSnapshot> = agents
            .iter()
            .map(|(id, entry)| snapshot(id, entry))
            .collect();
        list.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        list
    }

    /// Snapshot of a single agent.
    pub fn get_agent(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.get(agent_id).map(|entry| snapshot(agent_id, entry))
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.get(agent_id).is_some_and(|e| e.connected)
    }

    /// Forget agents that have been disconnected for longer than `older_than`.
    pub fn prune_disconnected(&self, older_than: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return Vec::new();
        };
        let pruned: Vec<String> = {
            let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<String> = agents
                .iter()
                .filter(|(_, e)| !e.connected && e.disconnected_at.is_some_and(|at| at <= cutoff))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                agents.remove(id);
            }
            stale
        };

        for agent_id in &pruned {
            info!(agent_id = %agent_id, "Pruned disconnected agent");
            let _ = self.events.send(RegistryEvent::Pruned {
                agent_id: agent_id.clone(),
            });
        }
        pruned
    }

    /// Number of connected agents.
    pub fn connected_count(&self) -> usize {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.values().filter(|e| e.connected).count()
    }

    /// Total number of agents (including disconnected).
    pub fn total_count(&self) -> usize {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(agent_id: &str, entry: &AgentEntry) -> AgentSnapshot {
    AgentSnapshot {
        client_id: agent_id.to_string(),
        client_name: entry.name.clone(),
        connected: entry.connected,
        last_heartbeat: entry.last_heartbeat,
        registered_at: entry.registered_at,
    }
}
