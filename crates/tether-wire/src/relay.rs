//! RelayNode: WebSocket listener that agents dial into.
//!
//! A [`RelayNode`] binds a TCP listener, upgrades each accepted connection to
//! WebSocket, and runs a read loop per agent. Outbound envelopes go through a
//! [`ConnectionHandle`] whose writer task owns the socket's sink, so the
//! registry and correlator never touch the socket directly.
//!
//! A connection speaks for exactly one agent: the first id it registers.
//! Transfer envelopes are attributed to that id, so a connection can neither
//! answer another agent's requests nor take over a second identity.
//!
//! Closing a socket marks its agent disconnected. Transfers in flight on that
//! agent are left to their own expiry timers.

use crate::correlator::RequestCorrelator;
use crate::registry::{AgentRegistry, ConnectionHandle};
use crate::transport::{parse_frame, socket_config, to_frame, Inbound, WireError};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_types::config::RelayConfig;
use tether_types::Envelope;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The relay's agent-facing endpoint.
pub struct RelayNode {
    local_addr: SocketAddr,
    registry: AgentRegistry,
    correlator: RequestCorrelator,
}

impl RelayNode {
    /// Bind `config.agent_listen` and start accepting agents.
    ///
    /// Also starts the retention sweep when `config.retention_secs` is set.
    /// Both tasks stop when `shutdown` flips to true.
    pub async fn start(
        config: &RelayConfig,
        correlator: RequestCorrelator,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(config.agent_listen).await?;
        let local_addr = listener.local_addr()?;
        let registry = correlator.registry().clone();

        info!("Relay: accepting agents on {}", local_addr);

        let node = Arc::new(Self {
            local_addr,
            registry: registry.clone(),
            correlator: correlator.clone(),
        });

        if let Some(retention) = config.retention() {
            let sweep_every = Duration::from_secs(config.retention_sweep_secs.max(1));
            tokio::spawn(retention_sweep(
                registry,
                retention,
                sweep_every,
                shutdown.clone(),
            ));
        }

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, node_clone, shutdown).await;
        });

        Ok((node, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    async fn accept_loop(
        listener: TcpListener,
        node: Arc<RelayNode>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Relay: listener shutting down");
                        return;
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("Relay: accepted connection from {}", addr);
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        if let Err(e) = node.handle_connection(stream, addr).await {
                            debug!("Relay: connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Relay: accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Upgrade one connection and serve it until it closes.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), WireError> {
        let ws =
            tokio_tungstenite::accept_async_with_config(stream, Some(socket_config())).await?;
        let (mut sink, mut source) = ws.split();
        let (handle, mut outbound) = ConnectionHandle::channel();
        let connection_id = handle.id();
        let mut agent_id: Option<String> = None;

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                let frame = match to_frame(&envelope) {
                    Ok(f) => f,
                    Err(e) => {
                        error!("Relay: failed to encode {}: {}", envelope.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    debug!("Relay: write to {} failed: {}", addr, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let result = loop {
            let frame = match source.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(WireError::from(e)),
                None => break Ok(()),
            };
            match parse_frame(frame) {
                Ok(Inbound::Envelope(envelope)) => {
                    self.dispatch(envelope, &handle, &mut agent_id, addr)
                }
                Ok(Inbound::Closed) => break Ok(()),
                Ok(Inbound::Ignored) => {}
                Err(e) => warn!("Relay: malformed envelope from {}: {}", addr, e),
            }
        };

        self.registry.mark_disconnected(connection_id);
        writer.abort();
        result
    }

    /// Handle one envelope from the connection behind `handle`. `agent_id`
    /// is the id this connection registered, if any.
    fn dispatch(
        &self,
        envelope: Envelope,
        handle: &ConnectionHandle,
        agent_id: &mut Option<String>,
        addr: SocketAddr,
    ) {
        match envelope {
            Envelope::Register {
                client_id,
                client_name,
            } => {
                if let Some(current) = agent_id.as_deref() {
                    if current != client_id {
                        warn!(
                            "Relay: {} is registered as {}, ignoring register as {}",
                            addr, current, client_id
                        );
                        return;
                    }
                }
                self.registry
                    .register(&client_id, client_name.as_deref(), handle.clone());
                *agent_id = Some(client_id);
            }
            Envelope::Heartbeat { client_id } => {
                if agent_id.as_deref() == Some(client_id.as_str()) {
                    self.registry.record_heartbeat(&client_id);
                } else {
                    debug!("Relay: heartbeat for {} from {} ignored", client_id, addr);
                }
            }
            transfer @ (Envelope::FileChunk { .. }
            | Envelope::FileComplete { .. }
            | Envelope::Error { .. }) => match agent_id.as_deref() {
                Some(sender) => {
                    self.correlator.dispatch(sender, transfer);
                }
                None => {
                    warn!(
                        "Relay: {} envelope from unregistered connection {}",
                        transfer.kind(),
                        addr
                    );
                }
            },
            other => {
                warn!(
                    "Relay: unexpected {} envelope from {}",
                    other.kind(),
                    addr
                );
            }
        }
    }
}

/// Periodically forget agents that stayed disconnected past `retention`.
async fn retention_sweep(
    registry: AgentRegistry,
    retention: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pruned = registry.prune_disconnected(retention);
                if !pruned.is_empty() {
                    debug!(count = pruned.len(), "Retention sweep pruned agents");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
