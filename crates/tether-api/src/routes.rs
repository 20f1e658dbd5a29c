//! Route handlers for the relay's HTTP API.

use crate::downloads::DownloadStore;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tether_types::TetherError;
use tether_wire::RequestCorrelator;
use tracing::{info, warn};

/// Shared state behind every handler.
pub struct AppState {
    pub correlator: RequestCorrelator,
    pub store: DownloadStore,
    /// Used when a download request names no chunk size.
    pub default_chunk_size: usize,
}

/// Body of `POST /api/download/request`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequestBody {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

/// Map a relay error onto the status and body callers see.
pub fn error_response(err: &TetherError) -> Response {
    let status = match err {
        TetherError::AgentNotFound(_) | TetherError::AgentNotConnected(_) => StatusCode::NOT_FOUND,
        TetherError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        TetherError::TransferTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        TetherError::TransferFailed(_) | TetherError::IncompleteTransfer { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "message": err.to_string(),
        })),
    )
        .into_response()
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "OK",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// POST /api/download/request: pull a file from an agent and store it.
///
/// Holds the HTTP request open until the transfer resolves.
pub async fn request_download(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DownloadRequestBody>,
) -> Response {
    let client_id = body.client_id.trim();
    let file_path = body.file_path.as_str();
    if client_id.is_empty() || file_path.trim().is_empty() {
        return error_response(&TetherError::InvalidInput(
            "clientId and filePath are required".to_string(),
        ));
    }
    let chunk_size = body.chunk_size.unwrap_or(state.default_chunk_size);

    let outcome = match state
        .correlator
        .request_file(client_id, file_path, chunk_size)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(agent_id = client_id, file = file_path, error = %e, "Download failed");
            return error_response(&e);
        }
    };

    let saved = match state.store.save(client_id, file_path, &outcome.bytes).await {
        Ok(saved) => saved,
        Err(e) => {
            warn!(agent_id = client_id, error = %e, "Could not store download");
            return error_response(&e);
        }
    };
    info!(
        agent_id = client_id,
        request_id = %outcome.request_id,
        chunks = outcome.chunk_count,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "Download complete"
    );

    Json(serde_json::json!({
        "success": true,
        "message": "File downloaded successfully",
        "filePath": saved.file_path,
        "fileSize": saved.size,
        "fileName": saved.file_name,
    }))
    .into_response()
}

/// GET /api/download/list
pub async fn list_downloads(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list().await {
        Ok(files) => Json(serde_json::json!({
            "success": true,
            "files": files,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/clients
pub async fn list_clients(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.correlator.registry();
    let clients = registry.list_agents();
    let connected = clients.iter().filter(|c| c.connected).count();
    Json(serde_json::json!({
        "success": true,
        "totalClients": clients.len(),
        "connectedClients": connected,
        "clients": clients,
    }))
}

/// GET /api/clients/{client_id}
pub async fn get_client(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Response {
    match state.correlator.registry().get_agent(&client_id) {
        Some(client) => Json(serde_json::json!({
            "success": true,
            "client": client,
        }))
        .into_response(),
        None => error_response(&TetherError::AgentNotFound(client_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (TetherError::AgentNotFound("a".into()), StatusCode::NOT_FOUND),
            (TetherError::AgentNotConnected("a".into()), StatusCode::NOT_FOUND),
            (TetherError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                TetherError::TransferTimeout {
                    request_id: "r".into(),
                    timeout: Duration::from_secs(300),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (TetherError::TransferFailed("x".into()), StatusCode::BAD_GATEWAY),
            (
                TetherError::IncompleteTransfer {
                    request_id: "r".into(),
                    missing: 1,
                    first_missing: vec![1],
                },
                StatusCode::BAD_GATEWAY,
            ),
            (TetherError::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(&err).status(), expected, "{err}");
        }
    }

    #[test]
    fn test_body_defaults() {
        let body: DownloadRequestBody = serde_json::from_str(r#"{"clientId":"a1"}"#).unwrap();
        assert_eq!(body.client_id, "a1");
        assert!(body.file_path.is_empty());
        assert!(body.chunk_size.is_none());
    }
}
