//! Transfer responder: serves `download_request` commands on the agent.
//!
//! A request is answered with either:
//! - `file_chunk` envelopes numbered from 0, then exactly one `file_complete`
//! - or a single `error` envelope (missing file, unreadable file, read failure
//!   partway through)
//!
//! Never both. Requests on one connection are served one at a time in arrival
//! order by [`spawn_worker`].

use std::path::Path;
use std::sync::Arc;
use tether_types::message::encode_chunk;
use tether_types::{Envelope, RequestId, TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One queued download command.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub request_id: RequestId,
    pub file_path: String,
    pub chunk_size: usize,
}

/// Reads local files and emits them as transfer envelopes.
#[derive(Debug, Clone)]
pub struct TransferResponder {
    max_chunk_size: usize,
}

impl TransferResponder {
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size: max_chunk_size.max(1),
        }
    }

    /// Requested size clamped to `1..=max_chunk_size`.
    pub fn effective_chunk_size(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_chunk_size)
    }

    /// Serve one request onto `out`. Returns the number of chunks sent.
    ///
    /// File errors are reported to the relay as an `error` envelope and
    /// returned. `ConnectionClosed` means `out` is gone and nothing more can
    /// be reported.
    pub async fn serve(
        &self,
        request_id: &RequestId,
        file_path: &str,
        chunk_size: usize,
        out: &mpsc::UnboundedSender<Envelope>,
    ) -> TetherResult<u64> {
        let chunk_size = self.effective_chunk_size(chunk_size);
        info!(request_id = %request_id, file = file_path, chunk_size, "Serving download request");

        let file = match open_regular_file(file_path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(request_id = %request_id, file = file_path, error = %e, "Cannot serve file");
                emit(
                    out,
                    Envelope::Error {
                        request_id: request_id.clone(),
                        message: e.to_string(),
                    },
                )?;
                return Err(e);
            }
        };

        self.stream(request_id, file, chunk_size, out).await
    }

    /// Chunk any reader. Split from [`serve`](Self::serve) so read failures
    /// can be exercised without a real file.
    pub async fn stream<R>(
        &self,
        request_id: &RequestId,
        mut reader: R,
        chunk_size: usize,
        out: &mpsc::UnboundedSender<Envelope>,
    ) -> TetherResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = self.effective_chunk_size(chunk_size);
        let mut buf = vec![0u8; chunk_size];
        let mut index: u64 = 0;
        let mut total_bytes: u64 = 0;

        loop {
            let filled = match fill_buffer(&mut reader, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let err = TetherError::FileReadError(e.to_string());
                    warn!(request_id = %request_id, chunk_index = index, error = %e, "Read failed mid-transfer");
                    emit(
                        out,
                        Envelope::Error {
                            request_id: request_id.clone(),
                            message: err.to_string(),
                        },
                    )?;
                    return Err(err);
                }
            };
            if filled == 0 {
                break;
            }

            emit(
                out,
                Envelope::FileChunk {
                    request_id: request_id.clone(),
                    chunk: encode_chunk(&buf[..filled]),
                    chunk_index: index,
                },
            )?;
            index += 1;
            total_bytes += filled as u64;
            debug!(request_id = %request_id, chunks = index, bytes = total_bytes, "Transfer progress");

            if filled < buf.len() {
                break;
            }
        }

        emit(
            out,
            Envelope::FileComplete {
                request_id: request_id.clone(),
                success: true,
                message: "File transferred successfully".to_string(),
                total_chunks: Some(index),
            },
        )?;
        info!(request_id = %request_id, chunks = index, bytes = total_bytes, "Transfer finished");
        Ok(index)
    }
}

/// Start the serial transfer worker for one connection.
///
/// Jobs are served in the order they were queued. The worker exits when the
/// job sender is dropped or the outbound channel closes.
pub fn spawn_worker(
    responder: Arc<TransferResponder>,
    out: mpsc::UnboundedSender<Envelope>,
) -> (mpsc::UnboundedSender<TransferJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TransferJob>();
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match responder
                .serve(&job.request_id, &job.file_path, job.chunk_size, &out)
                .await
            {
                Ok(_) => {}
                Err(TetherError::ConnectionClosed) => {
                    debug!(request_id = %job.request_id, "Connection closed during transfer");
                    break;
                }
                // Already reported to the relay.
                Err(_) => {}
            }
        }
    });
    (tx, handle)
}

async fn open_regular_file(file_path: &str) -> TetherResult<tokio::fs::File> {
    let path = Path::new(file_path);
    let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TetherError::FileNotFound(file_path.to_string()),
        _ => TetherError::FileReadError(format!("{file_path}: {e}")),
    })?;
    if !metadata.is_file() {
        return Err(TetherError::FileReadError(format!(
            "{file_path}: not a regular file"
        )));
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|e| TetherError::FileReadError(format!("{file_path}: {e}")))
}

/// Read until `buf` is full or the reader hits EOF.
async fn fill_buffer<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn emit(out: &mpsc::UnboundedSender<Envelope>, envelope: Envelope) -> TetherResult<()> {
    out.send(envelope).map_err(|_| TetherError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tether_types::message::decode_chunk;
    use tokio::io::ReadBuf;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    fn reassemble(envelopes: &[Envelope]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (expected, envelope) in envelopes.iter().enumerate() {
            if let Envelope::FileChunk {
                chunk, chunk_index, ..
            } = envelope
            {
                assert_eq!(*chunk_index, expected as u64);
                bytes.extend(decode_chunk(chunk).unwrap());
            }
        }
        bytes
    }

    /// Yields `good` bytes, then fails.
    struct FailingReader {
        good: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.good == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk on fire",
                )));
            }
            let n = self.good.min(buf.remaining());
            buf.put_slice(&vec![7u8; n]);
            self.good -= n;
            Poll::Ready(Ok(()))
        }
    }

    // -----------------------------------------------------------------------
    // serve
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_serves_file_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();

        let responder = TransferResponder::new(1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rid = RequestId::from("r1");
        let path = file.path().to_string_lossy().to_string();

        let sent = responder.serve(&rid, &path, 1000, &tx).await.unwrap();
        assert_eq!(sent, 3);

        let envelopes = drain(&mut rx);
        assert_eq!(envelopes.len(), 4);
        assert_eq!(reassemble(&envelopes), data);
        match envelopes.last().unwrap() {
            Envelope::FileComplete {
                success,
                total_chunks,
                message,
                ..
            } => {
                assert!(*success);
                assert_eq!(*total_chunks, Some(3));
                assert_eq!(message, "File transferred successfully");
            }
            other => panic!("Expected FileComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 64]).unwrap();

        let responder = TransferResponder::new(1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let path = file.path().to_string_lossy().to_string();
        let sent = responder
            .serve(&RequestId::from("r1"), &path, 32, &tx)
            .await
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn test_empty_file_completes_with_zero_chunks() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let responder = TransferResponder::new(1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let path = file.path().to_string_lossy().to_string();

        let sent = responder
            .serve(&RequestId::from("r1"), &path, 1024, &tx)
            .await
            .unwrap();
        assert_eq!(sent, 0);
        let envelopes = drain(&mut rx);
        assert!(matches!(
            envelopes.as_slice(),
            [Envelope::FileComplete {
                success: true,
                total_chunks: Some(0),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_missing_file_sends_single_error() {
        let responder = TransferResponder::new(1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = responder
            .serve(&RequestId::from("r1"), "/no/such/file.bin", 1024, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::FileNotFound(_)));

        let envelopes = drain(&mut rx);
        assert_eq!(envelopes.len(), 1);
        match &envelopes[0] {
            Envelope::Error {
                request_id,
                message,
            } => {
                assert_eq!(request_id.as_str(), "r1");
                assert!(message.contains("File not found"));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let responder = TransferResponder::new(1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let path = dir.path().to_string_lossy().to_string();

        let err = responder
            .serve(&RequestId::from("r1"), &path, 1024, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::FileReadError(_)));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Envelope::Error { .. }]
        ));
    }

    #[tokio::test]
    async fn test_read_failure_midway_sends_error_not_complete() {
        let responder = TransferResponder::new(1 << 20);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = responder
            .stream(&RequestId::from("r1"), FailingReader { good: 20 }, 10, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::FileReadError(_)));

        let envelopes = drain(&mut rx);
        assert_eq!(envelopes.len(), 3);
        assert!(matches!(envelopes[0], Envelope::FileChunk { chunk_index: 0, .. }));
        assert!(matches!(envelopes[1], Envelope::FileChunk { chunk_index: 1, .. }));
        assert!(matches!(envelopes[2], Envelope::Error { .. }));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let responder = TransferResponder::new(1 << 20);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let err = responder
            .stream(&RequestId::from("r1"), &b"hello"[..], 2, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::ConnectionClosed));
    }

    #[test]
    fn test_chunk_size_clamped() {
        let responder = TransferResponder::new(4096);
        assert_eq!(responder.effective_chunk_size(0), 1);
        assert_eq!(responder.effective_chunk_size(1024), 1024);
        assert_eq!(responder.effective_chunk_size(1 << 30), 4096);
    }

    // -----------------------------------------------------------------------
    // worker
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_worker_serves_jobs_in_order() {
        let first = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(first.path(), vec![1u8; 300]).unwrap();
        let second = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(second.path(), vec![2u8; 300]).unwrap();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (jobs, worker) = spawn_worker(Arc::new(TransferResponder::new(1 << 20)), out_tx);
        for (rid, file) in [("a", &first), ("b", &second)] {
            jobs.send(TransferJob {
                request_id: RequestId::from(rid),
                file_path: file.path().to_string_lossy().to_string(),
                chunk_size: 100,
            })
            .unwrap();
        }
        drop(jobs);
        worker.await.unwrap();

        let ids: Vec<String> = drain(&mut out_rx)
            .iter()
            .map(|e| e.request_id().unwrap().to_string())
            .collect();
        // Four envelopes per job, never interleaved.
        assert_eq!(ids, vec!["a", "a", "a", "a", "b", "b", "b", "b"]);
    }
}
