//! HTTP surface: the join protocol carrier and the key plumbing.
//!
//! The join protocol is deliberately out-of-band from consensus traffic: a
//! joining node has no cluster knowledge yet, so it cannot use the
//! replicated log to ask for admission. It posts `{addr, id}` here instead,
//! and the receiving node turns that into a membership proposal.
//!
//! Writes and joins against a non-leader answer with the leader hint so the
//! caller can redirect instead of getting an opaque failure.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use maat_common::Error;
use maat_store::Store;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Join request body, as sent by a starting node.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    /// The sender's consensus-transport advertise address.
    pub addr: String,
    /// The sender's node identifier.
    pub id: String,
}

/// Binds the HTTP listener and serves the surface in a background task.
pub async fn serve(bind_addr: String, store: Arc<Store>) -> std::io::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/join", post(handle_join))
        .route(
            "/key/:key",
            get(handle_get).put(handle_set).delete(handle_delete),
        )
        .with_state(store);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %listener.local_addr()?, "http surface listening");

    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "http server stopped");
        }
    }))
}

async fn handle_join(
    State(store): State<Arc<Store>>,
    Json(request): Json<JoinRequest>,
) -> (StatusCode, Json<Value>) {
    let id = match request.id.parse::<u64>() {
        Ok(id) if id > 0 => id,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "id must be a positive integer" })),
            )
        }
    };

    match store.join(id, &request.addr).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(err) => error_response(&store, err),
    }
}

async fn handle_get(
    State(store): State<Arc<Store>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<Value>) {
    match store.get(&key) {
        Some(value) => (StatusCode::OK, Json(json!({ "key": key, "value": value }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "key not found" })),
        ),
    }
}

async fn handle_set(
    State(store): State<Arc<Store>>,
    Path(key): Path<String>,
    body: String,
) -> (StatusCode, Json<Value>) {
    match store.set(key, body).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(err) => error_response(&store, err),
    }
}

async fn handle_delete(
    State(store): State<Arc<Store>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<Value>) {
    match store.delete(key).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))),
        Err(err) => error_response(&store, err),
    }
}

/// Maps store errors onto HTTP responses, attaching the leader hint where it
/// helps the caller redirect.
fn error_response(store: &Store, err: Error) -> (StatusCode, Json<Value>) {
    match &err {
        Error::NotLeader { leader } => (
            StatusCode::MISDIRECTED_REQUEST,
            Json(json!({
                "error": err.to_string(),
                "leader": leader,
                "leader_addr": store.leader_addr(),
            })),
        ),
        Error::AlreadyMember { .. } => (
            StatusCode::CONFLICT,
            Json(json!({ "error": err.to_string() })),
        ),
        Error::CommitTimeout => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": err.to_string() })),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_request_deserializes_wire_format() {
        let request: JoinRequest =
            serde_json::from_str(r#"{"addr": "10.0.0.2:8786", "id": "2"}"#).unwrap();
        assert_eq!(request.addr, "10.0.0.2:8786");
        assert_eq!(request.id, "2");
    }

    #[test]
    fn test_join_request_rejects_missing_fields() {
        let result: Result<JoinRequest, _> = serde_json::from_str(r#"{"addr": "x:1"}"#);
        assert!(result.is_err());
    }
}
