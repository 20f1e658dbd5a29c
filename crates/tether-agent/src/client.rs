//! Agent connection lifecycle.
//!
//! connect → register → heartbeat + serve requests → (drop) → wait → connect.
//!
//! The loop only ends on shutdown. Each session owns a writer task (the only
//! thing touching the socket's sink) and a serial transfer worker, both torn
//! down when the session ends so nothing leaks across reconnects.

use crate::backoff::ReconnectPolicy;
use crate::responder::{spawn_worker, TransferJob, TransferResponder};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tether_types::config::AgentConfig;
use tether_types::message::{default_agent_name, MAX_CHUNK_SIZE};
use tether_types::{Envelope, TetherError, TetherResult};
use tether_wire::transport::{parse_frame, socket_config, to_frame, Inbound};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a closing session may spend flushing its writer.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Connection lost. `registered` tells whether the relay had accepted us.
    Lost { registered: bool },
    Shutdown,
}

/// A long-running agent process.
pub struct AgentClient {
    config: AgentConfig,
    agent_id: String,
    name: String,
    responder: Arc<TransferResponder>,
}

impl AgentClient {
    /// Validate the config and fix the agent's identity for the process
    /// lifetime.
    pub fn new(config: AgentConfig) -> TetherResult<Self> {
        let url = url::Url::parse(&config.server_url)
            .map_err(|e| TetherError::Config(format!("invalid server_url '{}': {e}", config.server_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TetherError::Config(format!(
                "server_url must use ws:// or wss://, got '{}'",
                config.server_url
            )));
        }
        if config.heartbeat_interval_secs == 0 {
            return Err(TetherError::Config(
                "heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        if config.max_chunk_size == 0 || config.max_chunk_size > MAX_CHUNK_SIZE {
            return Err(TetherError::Config(format!(
                "max_chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
                config.max_chunk_size
            )));
        }

        let agent_id = config
            .agent_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = config
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_agent_name(&agent_id));
        let responder = Arc::new(TransferResponder::new(config.max_chunk_size));

        Ok(Self {
            config,
            agent_id,
            name,
            responder,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stay attached to the relay until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut policy = ReconnectPolicy::from_config(&self.config.reconnect);
        info!(agent_id = %self.agent_id, name = %self.name, "Agent starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!("Connecting to relay at {}...", self.config.server_url);
            let connect = tokio_tungstenite::connect_async_with_config(
                self.config.server_url.as_str(),
                Some(socket_config()),
                false,
            );
            let connected = tokio::select! {
                connected = connect => connected,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match connected {
                Ok((ws, _)) => {
                    info!("Connected to relay");
                    match self.run_session(ws, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost { registered } => {
                            if registered {
                                policy.reset();
                            }
                        }
                    }
                }
                Err(e) => warn!("Relay connection failed: {e}"),
            }

            let delay = policy.next_delay();
            warn!(attempt = policy.attempts(), "Reconnecting in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!(agent_id = %self.agent_id, "Agent stopped");
    }

    async fn run_session(&self, ws: Socket, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut sink, mut source) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let frame = match to_frame(&envelope) {
                    Ok(f) => f,
                    Err(e) => {
                        error!("Failed to encode {}: {}", envelope.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    debug!("Write to relay failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });
        let (jobs, worker) = spawn_worker(Arc::clone(&self.responder), out_tx.clone());

        let _ = out_tx.send(Envelope::Register {
            client_id: self.agent_id.clone(),
            client_name: Some(self.name.clone()),
        });

        let period = self.config.heartbeat_interval();
        let max_missed = self.config.max_missed_heartbeats;
        let mut heartbeat: Option<Interval> = None;
        let mut registered = false;
        let mut missed: u32 = 0;

        let end = loop {
            tokio::select! {
                frame = source.next() => {
                    let frame = match frame {
                        Some(Ok(f)) => f,
                        Some(Err(e)) => {
                            warn!("Relay connection error: {e}");
                            break SessionEnd::Lost { registered };
                        }
                        None => {
                            info!("Relay connection closed");
                            break SessionEnd::Lost { registered };
                        }
                    };
                    let envelope = match parse_frame(frame) {
                        Ok(Inbound::Envelope(envelope)) => envelope,
                        Ok(Inbound::Closed) => {
                            info!("Relay closed the connection");
                            break SessionEnd::Lost { registered };
                        }
                        Ok(Inbound::Ignored) => continue,
                        Err(e) => {
                            warn!("Malformed envelope from relay: {e}");
                            continue;
                        }
                    };

                    match envelope {
                        Envelope::Registered { client_id, message } => {
                            info!(agent_id = %client_id, "Registered: {message}");
                            if !registered {
                                registered = true;
                                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                heartbeat = Some(ticker);
                            }
                        }
                        Envelope::HeartbeatAck => {
                            debug!("Heartbeat acknowledged");
                            missed = 0;
                        }
                        Envelope::DownloadRequest { request_id, file_path, chunk_size } => {
                            let job = TransferJob { request_id, file_path, chunk_size };
                            if jobs.send(job).is_err() {
                                warn!("Transfer worker stopped");
                                break SessionEnd::Lost { registered };
                            }
                        }
                        other => warn!("Unexpected {} envelope from relay", other.kind()),
                    }
                }
                _ = tick(&mut heartbeat) => {
                    if max_missed > 0 && missed >= max_missed {
                        warn!(missed, "Relay stopped acknowledging heartbeats, dropping connection");
                        break SessionEnd::Lost { registered };
                    }
                    let beat = Envelope::Heartbeat { client_id: self.agent_id.clone() };
                    if out_tx.send(beat).is_err() {
                        break SessionEnd::Lost { registered };
                    }
                    missed += 1;
                }
                _ = wait_for_shutdown(shutdown) => {
                    info!("Agent shutting down");
                    break SessionEnd::Shutdown;
                }
            }
        };

        worker.abort();
        drop(jobs);
        drop(out_tx);
        let writer_abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
            writer_abort.abort();
        }
        end
    }
}

/// Wait for the next heartbeat tick, or forever before registration.
async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
