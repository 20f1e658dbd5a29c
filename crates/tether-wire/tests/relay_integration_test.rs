//! Integration tests for the RelayNode over real loopback WebSockets.
//!
//! A scripted agent connects with tokio-tungstenite and speaks the envelope
//! protocol by hand, so every relay-side path is exercised without the agent
//! crate.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tether_types::config::RelayConfig;
use tether_types::message::{decode_envelope, encode_chunk, encode_envelope, MAX_CHUNK_SIZE};
use tether_types::{Envelope, RequestId, TetherError};
use tether_wire::{AgentRegistry, RegistryEvent, RelayNode, RequestCorrelator};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_relay(timeout: Duration) -> (Arc<RelayNode>, watch::Sender<bool>) {
    let registry = AgentRegistry::new();
    let correlator = RequestCorrelator::new(registry, timeout);
    let config = RelayConfig {
        agent_listen: "127.0.0.1:0".parse().unwrap(),
        ..RelayConfig::default()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (node, _task) = RelayNode::start(&config, correlator, shutdown_rx)
        .await
        .unwrap();
    (node, shutdown_tx)
}

async fn connect(node: &RelayNode) -> Socket {
    let url = format!("ws://{}", node.local_addr());
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws
}

async fn send(ws: &mut Socket, envelope: &Envelope) {
    ws.send(Message::Text(encode_envelope(envelope).unwrap()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Socket) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return decode_envelope(&text).unwrap();
        }
    }
}

async fn register(ws: &mut Socket, id: &str) {
    send(
        ws,
        &Envelope::Register {
            client_id: id.to_string(),
            client_name: Some(format!("{id}-host")),
        },
    )
    .await;
    match recv(ws).await {
        Envelope::Registered { client_id, .. } => assert_eq!(client_id, id),
        other => panic!("Expected Registered, got {other:?}"),
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn expect_download(envelope: Envelope) -> (RequestId, String, usize) {
    match envelope {
        Envelope::DownloadRequest {
            request_id,
            file_path,
            chunk_size,
        } => (request_id, file_path, chunk_size),
        other => panic!("Expected DownloadRequest, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_and_transfer() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let mut agent = connect(&node).await;
    register(&mut agent, "a1").await;
    assert!(node.registry().is_connected("a1"));

    let file: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let correlator = node.correlator().clone();
    let download =
        tokio::spawn(async move { correlator.request_file("a1", "/tmp/f.bin", 65536).await });

    let (rid, path, chunk_size) = expect_download(recv(&mut agent).await);
    assert_eq!(path, "/tmp/f.bin");
    for (i, piece) in file.chunks(chunk_size).enumerate() {
        send(
            &mut agent,
            &Envelope::FileChunk {
                request_id: rid.clone(),
                chunk: encode_chunk(piece),
                chunk_index: i as u64,
            },
        )
        .await;
    }
    send(
        &mut agent,
        &Envelope::FileComplete {
            request_id: rid,
            success: true,
            message: "File transferred successfully".to_string(),
            total_chunks: Some(3),
        },
    )
    .await;

    let outcome = download.await.unwrap().unwrap();
    assert_eq!(outcome.bytes, file);
    assert_eq!(outcome.chunk_count, 3);
}

#[tokio::test]
async fn test_heartbeat_ack_only_for_known_agent() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let mut agent = connect(&node).await;

    // Not registered yet: no reply.
    send(
        &mut agent,
        &Envelope::Heartbeat {
            client_id: "a1".to_string(),
        },
    )
    .await;
    register(&mut agent, "a1").await;

    send(
        &mut agent,
        &Envelope::Heartbeat {
            client_id: "a1".to_string(),
        },
    )
    .await;
    assert_eq!(recv(&mut agent).await, Envelope::HeartbeatAck);
}

#[tokio::test]
async fn test_malformed_frames_do_not_end_session() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let mut agent = connect(&node).await;
    register(&mut agent, "a1").await;

    agent
        .send(Message::Text("{ not json".to_string()))
        .await
        .unwrap();
    agent
        .send(Message::Text(r#"{"type":"warp_drive"}"#.to_string()))
        .await
        .unwrap();
    agent.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

    send(
        &mut agent,
        &Envelope::Heartbeat {
            client_id: "a1".to_string(),
        },
    )
    .await;
    assert_eq!(recv(&mut agent).await, Envelope::HeartbeatAck);
    assert!(node.registry().is_connected("a1"));
}

#[tokio::test]
async fn test_disconnect_then_reconnect_keeps_identity() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let mut events = node.registry().subscribe();

    let mut first = connect(&node).await;
    register(&mut first, "a1").await;
    first.close(None).await.unwrap();
    drop(first);

    let registry = node.registry().clone();
    wait_for(|| !registry.is_connected("a1")).await;
    assert_eq!(registry.total_count(), 1);

    let mut second = connect(&node).await;
    register(&mut second, "a1").await;
    assert!(registry.is_connected("a1"));
    assert_eq!(registry.total_count(), 1);
    assert_eq!(registry.get_agent("a1").unwrap().client_name, "a1-host");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            RegistryEvent::Connected {
                agent_id: "a1".to_string(),
                reconnect: false,
            },
            RegistryEvent::Disconnected {
                agent_id: "a1".to_string(),
            },
            RegistryEvent::Connected {
                agent_id: "a1".to_string(),
                reconnect: true,
            },
        ]
    );
}

#[tokio::test]
async fn test_disconnect_mid_transfer_times_out() {
    let (node, _shutdown) = start_relay(Duration::from_millis(500)).await;
    let mut agent = connect(&node).await;
    register(&mut agent, "a1").await;

    let correlator = node.correlator().clone();
    let mut download =
        tokio::spawn(async move { correlator.request_file("a1", "/tmp/f.bin", 4).await });

    let (rid, _, _) = expect_download(recv(&mut agent).await);
    send(
        &mut agent,
        &Envelope::FileChunk {
            request_id: rid,
            chunk: encode_chunk(b"abcd"),
            chunk_index: 0,
        },
    )
    .await;
    drop(agent);

    let registry = node.registry().clone();
    wait_for(|| !registry.is_connected("a1")).await;

    // The disconnect alone does not resolve the request.
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut download)
        .await
        .is_err());

    let err = download.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::TransferTimeout { .. }));
    assert_eq!(node.correlator().pending_count(), 0);
}

#[tokio::test]
async fn test_request_to_unregistered_agent() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let err = node
        .correlator()
        .request_file("ghost", "/tmp/f.bin", 1024)
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::AgentNotFound(_)));
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (node, shutdown) = start_relay(Duration::from_secs(30)).await;
    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = format!("ws://{}", node.local_addr());
    let attempt = tokio::time::timeout(
        Duration::from_secs(2),
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await;
    assert!(!matches!(attempt, Ok(Ok(_))));
}

#[tokio::test]
async fn test_full_size_chunk_crosses_relay() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let mut agent = connect(&node).await;
    register(&mut agent, "a1").await;

    let correlator = node.correlator().clone();
    let download = tokio::spawn(async move {
        correlator
            .request_file("a1", "/tmp/big.bin", MAX_CHUNK_SIZE)
            .await
    });

    let (rid, _, chunk_size) = expect_download(recv(&mut agent).await);
    assert_eq!(chunk_size, MAX_CHUNK_SIZE);
    let piece = vec![0xa5u8; chunk_size];
    send(
        &mut agent,
        &Envelope::FileChunk {
            request_id: rid.clone(),
            chunk: encode_chunk(&piece),
            chunk_index: 0,
        },
    )
    .await;
    send(
        &mut agent,
        &Envelope::FileComplete {
            request_id: rid,
            success: true,
            message: String::new(),
            total_chunks: Some(1),
        },
    )
    .await;

    let outcome = download.await.unwrap().unwrap();
    assert_eq!(outcome.bytes.len(), MAX_CHUNK_SIZE);
    assert!(node.registry().is_connected("a1"));
}

#[tokio::test]
async fn test_other_agent_cannot_answer_request() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let mut owner = connect(&node).await;
    register(&mut owner, "a1").await;
    let mut other = connect(&node).await;
    register(&mut other, "a2").await;
    let mut anonymous = connect(&node).await;

    let correlator = node.correlator().clone();
    let download =
        tokio::spawn(async move { correlator.request_file("a1", "/tmp/f.bin", 16).await });
    let (rid, _, _) = expect_download(recv(&mut owner).await);

    for socket in [&mut other, &mut anonymous] {
        send(
            socket,
            &Envelope::FileChunk {
                request_id: rid.clone(),
                chunk: encode_chunk(b"forged"),
                chunk_index: 0,
            },
        )
        .await;
        send(
            socket,
            &Envelope::FileComplete {
                request_id: rid.clone(),
                success: true,
                message: String::new(),
                total_chunks: Some(1),
            },
        )
        .await;
    }

    // Round-trip on each socket so the forged envelopes have been read.
    send(
        &mut other,
        &Envelope::Heartbeat {
            client_id: "a2".to_string(),
        },
    )
    .await;
    assert_eq!(recv(&mut other).await, Envelope::HeartbeatAck);
    assert_eq!(node.correlator().pending_count(), 1);

    send(
        &mut owner,
        &Envelope::FileChunk {
            request_id: rid.clone(),
            chunk: encode_chunk(b"genuine"),
            chunk_index: 0,
        },
    )
    .await;
    send(
        &mut owner,
        &Envelope::FileComplete {
            request_id: rid,
            success: true,
            message: String::new(),
            total_chunks: Some(1),
        },
    )
    .await;

    assert_eq!(download.await.unwrap().unwrap().bytes, b"genuine");
}

#[tokio::test]
async fn test_one_identity_per_connection() {
    let (node, _shutdown) = start_relay(Duration::from_secs(30)).await;
    let mut agent = connect(&node).await;
    register(&mut agent, "a1").await;

    send(
        &mut agent,
        &Envelope::Register {
            client_id: "a2".to_string(),
            client_name: None,
        },
    )
    .await;
    // Same id again is re-acknowledged.
    register(&mut agent, "a1").await;

    let registry = node.registry().clone();
    assert!(registry.get_agent("a2").is_none());
    assert_eq!(registry.total_count(), 1);

    drop(agent);
    wait_for(|| !registry.is_connected("a1")).await;
    assert_eq!(registry.connected_count(), 0);
}
