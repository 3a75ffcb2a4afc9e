//! HTTP front end
//!
//! Routes:
//! - `GET    /state/{name}/{state_id}` - read the current state
//! - `POST   /state/{name}/{state_id}?ID=<lock id>` - write a new version (also `PUT`)
//! - `DELETE /state/{name}/{state_id}?ID=<lock id>` - write an empty version
//! - `LOCK   /state/{name}/{state_id}` - acquire the lock described by the body
//! - `UNLOCK /state/{name}/{state_id}` - release the lock described by the body
//! - `GET    /health` - liveness check
//!
//! Request bodies are not size limited.

use std::net::SocketAddr;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{error, info, warn};
use md5::{Digest, Md5};
use serde::Deserialize;
use tokio::net::TcpListener;

use tflocker_state::{LockInfo, LockToken, StateError, StateKey, StateStore};

use crate::shutdown;

const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

/// Build the router serving the state backend
pub fn router(store: StateStore) -> Router {
    Router::new()
        .route("/state/{name}/{state_id}", any(handle_state))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .with_state(store)
}

/// Serve until Ctrl-C or SIGTERM, then drain in-flight requests
pub async fn serve(addr: SocketAddr, store: StateStore) -> Result<(), String> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

    info!("Start REST service at {}", addr);
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await
        .map_err(|e| format!("HTTP server failed: {}", e))?;

    info!("HTTP server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    #[serde(rename = "ID")]
    id: Option<String>,
}

async fn handle_state(
    State(store): State<StateStore>,
    Path((name, state_id)): Path<(String, String)>,
    Query(params): Query<WriteParams>,
    method: Method,
    body: Bytes,
) -> Response {
    let key = match StateKey::parse(&name, &state_id) {
        Ok(key) => key,
        Err(e) => {
            warn!("Invalid state address {} {}: {}", name, state_id, e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let token = LockToken::from_query(params.id.as_deref());
    match method.as_str() {
        "GET" => get_state(&store, &key).await,
        "POST" | "PUT" => set_state(&store, &key, &token, &body).await,
        "DELETE" => delete_state(&store, &key, &token).await,
        "LOCK" => lock_state(&store, &key, &LockToken::from_lock_body(&body)).await,
        "UNLOCK" => unlock_state(&store, &key, &LockToken::from_lock_body(&body)).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn get_state(store: &StateStore, key: &StateKey) -> Response {
    let data = match store.read(key).await {
        Ok(data) => data,
        Err(e) => return error_response("GET", key, e),
    };

    if data.is_empty() {
        info!("GET: {} 0", key);
        return StatusCode::OK.into_response();
    }

    let hash = md5_hash(&data);
    info!("GET: {} {} {}", key, data.len(), hash);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (CONTENT_MD5, hash),
        ],
        data,
    )
        .into_response()
}

async fn set_state(store: &StateStore, key: &StateKey, token: &LockToken, body: &[u8]) -> Response {
    if token.is_empty() {
        info!("SET: {} without lock id", key);
    }

    match store.write(key, token, body).await {
        Ok(()) => {
            info!("SET: {} {} {}", key, body.len(), md5_hash(body));
            StatusCode::OK.into_response()
        }
        Err(e) => error_response("SET", key, e),
    }
}

async fn delete_state(store: &StateStore, key: &StateKey, token: &LockToken) -> Response {
    match store.delete(key, token).await {
        Ok(()) => {
            info!("DELETE: {}", key);
            StatusCode::OK.into_response()
        }
        Err(e) => error_response("DELETE", key, e),
    }
}

async fn lock_state(store: &StateStore, key: &StateKey, token: &LockToken) -> Response {
    match store.acquire_lock(key, token).await {
        Ok(()) => {
            info!("LOCK: {} [{}]", key, token);
            StatusCode::OK.into_response()
        }
        Err(e) => error_response("LOCK", key, e),
    }
}

async fn unlock_state(store: &StateStore, key: &StateKey, token: &LockToken) -> Response {
    match store.release_lock(key, token).await {
        Ok(()) => {
            info!("UNLOCK: {} [{}]", key, token);
            StatusCode::OK.into_response()
        }
        Err(e) => error_response("UNLOCK", key, e),
    }
}

/// Map a protocol failure to its HTTP status
fn error_response(verb: &str, key: &StateKey, err: StateError) -> Response {
    match &err {
        StateError::AlreadyLocked { current, .. } => {
            info!("{}: {} already locked by [{}]", verb, key, current);
            (StatusCode::LOCKED, Json(LockInfo::holder(current))).into_response()
        }
        StateError::Conflict { .. } | StateError::NotHeld { .. } => {
            warn!("{}: {}", verb, err);
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        StateError::EmptyToken => {
            warn!("{}: {}: {}", verb, key, err);
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        StateError::Inconsistency { .. } | StateError::Ledger(_) => {
            error!("{} failed for {}: {}", verb, key, err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Base64-encoded MD5 digest, as sent in `Content-MD5`
fn md5_hash(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}
