//! Request correlation: turns a download command into an awaitable result.
//!
//! [`RequestCorrelator::request_file`] mints a request id, parks a
//! `PendingRequest` in the table, and sends `download_request` through the
//! registry. Inbound `file_chunk`, `file_complete`, and `error` envelopes are
//! routed to the pending entry by request id, and only when they come from
//! the agent the request was sent to.
//!
//! Each pending entry is removed from the table exactly once: by completion,
//! by an agent-reported failure, or by its expiry timer. Whichever removes it
//! resolves the caller; the others find nothing and drop their envelope.

use crate::assembler::{AssemblyError, ChunkAssembler};
use crate::registry::AgentRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_types::message::{decode_chunk, MAX_CHUNK_SIZE};
use tether_types::{Envelope, RequestId, TetherError, TetherResult};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// A completed transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub request_id: RequestId,
    /// Message carried by the agent's `file_complete`.
    pub message: String,
    /// The reassembled file.
    pub bytes: Vec<u8>,
    pub chunk_count: u64,
    pub elapsed: Duration,
}

struct PendingRequest {
    agent_id: String,
    chunks: ChunkAssembler,
    completion: oneshot::Sender<TetherResult<TransferOutcome>>,
    expiry: Option<AbortHandle>,
    started: Instant,
}

impl PendingRequest {
    fn resolve(self, result: TetherResult<TransferOutcome>) {
        if let Some(timer) = &self.expiry {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing else to do then.
        let _ = self.completion.send(result);
    }
}

struct Inner {
    registry: AgentRegistry,
    pending: DashMap<RequestId, PendingRequest>,
    timeout: Duration,
}

/// Tracks in-flight transfers. Cheap to clone; clones share one table.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<Inner>,
}

impl RequestCorrelator {
    pub fn new(registry: AgentRegistry, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                pending: DashMap::new(),
                timeout,
            }),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Number of transfers still waiting for completion.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Ask `agent_id` for `file_path` and wait for the reassembled bytes.
    ///
    /// Fails before anything is sent if the agent is unknown or detached.
    /// Otherwise resolves on completion, on an agent-reported failure, or
    /// with `TransferTimeout` once the window elapses.
    pub async fn request_file(
        &self,
        agent_id: &str,
        file_path: &str,
        chunk_size: usize,
    ) -> TetherResult<TransferOutcome> {
        self.inner.registry.ensure_connected(agent_id)?;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(TetherError::InvalidInput(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes"
            )));
        }

        let request_id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            request_id.clone(),
            PendingRequest {
                agent_id: agent_id.to_string(),
                chunks: ChunkAssembler::new(),
                completion: tx,
                expiry: None,
                started: Instant::now(),
            },
        );

        let timer = {
            let correlator = self.clone();
            let request_id = request_id.clone();
            let timeout = self.inner.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                correlator.expire(&request_id);
            })
        };
        if let Some(mut entry) = self.inner.pending.get_mut(&request_id) {
            entry.expiry = Some(timer.abort_handle());
        }

        info!(
            agent_id,
            request_id = %request_id,
            file_path,
            chunk_size,
            "Requesting file from agent"
        );
        let command = Envelope::DownloadRequest {
            request_id: request_id.clone(),
            file_path: file_path.to_string(),
            chunk_size,
        };
        if let Err(e) = self.inner.registry.send(agent_id, command) {
            if let Some((_, pending)) = self.inner.pending.remove(&request_id) {
                if let Some(timer) = pending.expiry {
                    timer.abort();
                }
            }
            return Err(e);
        }

        rx.await.unwrap_or_else(|_| {
            Err(TetherError::TransferFailed(format!(
                "request {request_id} was dropped"
            )))
        })
    }

    /// Route an envelope received from agent `sender`. Returns false for
    /// non-transfer traffic.
    pub fn dispatch(&self, sender: &str, envelope: Envelope) -> bool {
        match envelope {
            Envelope::FileChunk {
                request_id,
                chunk,
                chunk_index,
            } => {
                self.handle_chunk(sender, &request_id, &chunk, chunk_index);
                true
            }
            Envelope::FileComplete {
                request_id,
                success,
                message,
                total_chunks,
            } => {
                self.handle_complete(sender, &request_id, success, message, total_chunks);
                true
            }
            Envelope::Error {
                request_id,
                message,
            } => {
                self.handle_error(sender, &request_id, message);
                true
            }
            _ => false,
        }
    }

    /// Store one chunk at its declared index.
    pub fn handle_chunk(
        &self,
        sender: &str,
        request_id: &RequestId,
        chunk: &str,
        chunk_index: u64,
    ) {
        let Some(mut pending) = self.inner.pending.get_mut(request_id) else {
            debug!(request_id = %request_id, chunk_index, "Dropping chunk for unknown request");
            return;
        };
        if pending.agent_id != sender {
            warn!(
                request_id = %request_id,
                sender,
                owner = %pending.agent_id,
                "Dropping chunk from an agent that does not own the request"
            );
            return;
        }

        match decode_chunk(chunk) {
            Ok(bytes) => {
                let len = bytes.len();
                if !pending.chunks.insert(chunk_index, bytes) {
                    warn!(request_id = %request_id, chunk_index, "Duplicate chunk replaced");
                }
                debug!(
                    request_id = %request_id,
                    chunk_index,
                    len,
                    received = pending.chunks.len(),
                    "Chunk stored"
                );
            }
            Err(e) => {
                // Left as a gap; reassembly will report it.
                warn!(request_id = %request_id, chunk_index, error = %e, "Undecodable chunk dropped");
            }
        }
    }

    /// Resolve a request from the agent's `file_complete`.
    pub fn handle_complete(
        &self,
        sender: &str,
        request_id: &RequestId,
        success: bool,
        message: String,
        total_chunks: Option<u64>,
    ) {
        let Some(mut pending) = self.take_owned(sender, request_id, "completion") else {
            return;
        };

        if !success {
            let message = if message.is_empty() {
                "File transfer failed".to_string()
            } else {
                message
            };
            warn!(request_id = %request_id, agent_id = %pending.agent_id, %message, "Agent reported failure");
            pending.resolve(Err(TetherError::TransferFailed(message)));
            return;
        }

        let chunks = std::mem::take(&mut pending.chunks);
        let chunk_count = total_chunks.unwrap_or(chunks.len() as u64);
        let elapsed = pending.started.elapsed();
        let result = match chunks.assemble(total_chunks) {
            Ok(bytes) => {
                info!(
                    request_id = %request_id,
                    agent_id = %pending.agent_id,
                    bytes = bytes.len(),
                    chunks = chunk_count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Transfer complete"
                );
                Ok(TransferOutcome {
                    request_id: request_id.clone(),
                    message,
                    bytes,
                    chunk_count,
                    elapsed,
                })
            }
            Err(AssemblyError::Gaps { missing, first }) => {
                warn!(
                    request_id = %request_id,
                    agent_id = %pending.agent_id,
                    missing,
                    "Transfer completed with missing chunks"
                );
                Err(TetherError::IncompleteTransfer {
                    request_id: request_id.to_string(),
                    missing,
                    first_missing: first,
                })
            }
            Err(AssemblyError::IndexOutOfRange(index)) => {
                warn!(
                    request_id = %request_id,
                    agent_id = %pending.agent_id,
                    chunk_index = index,
                    "Transfer completed with an out-of-range chunk index"
                );
                Err(TetherError::TransferFailed(format!(
                    "chunk index {index} is out of range"
                )))
            }
        };
        pending.resolve(result);
    }

    /// Fail a request from the agent's `error` envelope.
    pub fn handle_error(&self, sender: &str, request_id: &RequestId, message: String) {
        let Some(pending) = self.take_owned(sender, request_id, "error") else {
            return;
        };
        warn!(request_id = %request_id, agent_id = %pending.agent_id, %message, "Agent reported error");
        pending.resolve(Err(TetherError::TransferFailed(message)));
    }

    /// Remove the pending entry for `request_id` if `sender` owns it.
    fn take_owned(
        &self,
        sender: &str,
        request_id: &RequestId,
        what: &str,
    ) -> Option<PendingRequest> {
        if let Some((_, pending)) = self
            .inner
            .pending
            .remove_if(request_id, |_, pending| pending.agent_id == sender)
        {
            return Some(pending);
        }
        if self.inner.pending.contains_key(request_id) {
            warn!(
                request_id = %request_id,
                sender,
                "Dropping {} from an agent that does not own the request",
                what
            );
        } else {
            debug!(request_id = %request_id, "Dropping {} for unknown request", what);
        }
        None
    }

    fn expire(&self, request_id: &RequestId) {
        let Some((_, pending)) = self.inner.pending.remove(request_id) else {
            return;
        };
        warn!(
            request_id = %request_id,
            agent_id = %pending.agent_id,
            chunks = pending.chunks.len(),
            "Transfer timed out"
        );
        let timeout = self.inner.timeout;
        let _ = pending.completion.send(Err(TetherError::TransferTimeout {
            request_id: request_id.to_string(),
            timeout,
        }));
    }
}
