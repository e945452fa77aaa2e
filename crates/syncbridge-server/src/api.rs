//! HTTP API for partitions, replication and token management

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query as UrlQuery, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncbridge::catalog::RootRecord;
use syncbridge::sync::MAX_MESSAGE_SIZE;
use syncbridge::{auth, Caller, CatalogEntry, DocumentUrl, Error, Query};
use tracing::{debug, info, warn};

use crate::{link, AppState};

/// Provider name given to REST callers
const REST_PROVIDER: &str = "rest";

/// Provider name given to WebSocket callers
const WEBSOCKET_PROVIDER: &str = "websocket";

type ApiError = (StatusCode, String);

/// Create the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/catalog", get(catalog))
        .route("/automerge", get(list_partitions).post(create_partition))
        .route("/automerge/{url}", get(get_partition).delete(remove_partition))
        .route("/sync", get(sync_socket))
        .route("/tokens", post(issue_token))
        .route("/tokens/{name}", delete(revoke_token))
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "ok"
}

fn api_error(e: &Error) -> ApiError {
    let status = match e {
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unavailable(_) | Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::InvalidUrl(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn authenticate(state: &AppState, token: Option<&str>, provider: &str) -> Result<Caller, ApiError> {
    let token = token.ok_or((StatusCode::UNAUTHORIZED, "Missing access token".to_string()))?;
    let caller = auth::authenticate(state.authenticator.as_ref(), token, state.auth_timeout)
        .await
        .map_err(|e| {
            warn!(error = %e, "Authentication failed");
            api_error(&e)
        })?;
    Ok(Caller {
        provider: provider.to_string(),
        ..caller
    })
}

fn parse_url(raw: &str) -> Result<DocumentUrl, ApiError> {
    DocumentUrl::parse(raw).map_err(|e| api_error(&e))
}

/// Root catalog reference, for spokes bootstrapping against this node
async fn catalog(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RootRecord>, ApiError> {
    authenticate(&state, bearer_token(&headers), REST_PROVIDER).await?;
    Ok(Json(RootRecord {
        root_document_id: state.engine.root().url().clone(),
    }))
}

/// Partitions visible to the caller
async fn list_partitions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<CatalogEntry>>, ApiError> {
    let caller = authenticate(&state, bearer_token(&headers), REST_PROVIDER).await?;
    let entries = state
        .engine
        .find(Some(&caller))
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(entries))
}

/// Create (or return the existing) partition for a query
async fn create_partition(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(query): Json<Query>,
) -> Result<(StatusCode, Json<CatalogEntry>), ApiError> {
    let caller = authenticate(&state, bearer_token(&headers), REST_PROVIDER).await?;
    let entry = state
        .engine
        .create(query, Some(&caller))
        .await
        .map_err(|e| api_error(&e))?;
    info!(url = %entry.url, user = ?caller.user, "Partition requested");
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Snapshot of one partition
async fn get_partition(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(url): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let caller = authenticate(&state, bearer_token(&headers), REST_PROVIDER).await?;
    let url = parse_url(&url)?;
    let snapshot = state
        .engine
        .get(&url, Some(&caller))
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(snapshot))
}

/// Delete a partition
async fn remove_partition(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(url): Path<String>,
) -> Result<Json<CatalogEntry>, ApiError> {
    let caller = authenticate(&state, bearer_token(&headers), REST_PROVIDER).await?;
    let url = parse_url(&url)?;
    let entry = state
        .engine
        .remove(&url, Some(&caller))
        .await
        .map_err(|e| api_error(&e))?;
    info!(url = %entry.url, user = ?caller.user, "Partition removed");
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct SyncParams {
    access_token: Option<String>,
}

/// Replication over WebSocket
///
/// Authentication runs before the upgrade; a rejected caller gets a plain
/// 401 and no socket.
async fn sync_socket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    UrlQuery(params): UrlQuery<SyncParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = bearer_token(&headers).or(params.access_token.as_deref());
    let caller = match authenticate(&state, token, WEBSOCKET_PROVIDER).await {
        Ok(caller) => caller,
        Err(rejection) => return rejection.into_response(),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    info!(user = ?caller.user, "Accepted sync connection");
    let store = Arc::clone(&state.store);
    let shutdown = state.shutdown.clone();
    upgrade
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| link::serve_socket(socket, store, shutdown))
}

/// Request body for token issue
#[derive(Debug, Deserialize)]
struct IssueRequest {
    /// Admin password
    password: String,
    /// Token name
    name: String,
    /// User the token acts as
    user: Option<String>,
}

/// Response for a freshly issued token
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueResponse {
    /// Token name
    pub name: String,
    /// Plaintext token, shown once
    pub token: String,
}

/// Issue an access token
async fn issue_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IssueRequest>,
) -> Result<(StatusCode, Json<IssueResponse>), ApiError> {
    if req.password != state.admin_password {
        warn!(name = %req.name, "Token issue failed: invalid password");
        return Err((StatusCode::UNAUTHORIZED, "Invalid password".to_string()));
    }
    if req.name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Token name must not be empty".to_string()));
    }

    let token = state
        .tokens
        .issue(&req.name, req.user.as_deref())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;

    info!(name = %req.name, user = ?req.user, "Token issued");
    Ok((
        StatusCode::CREATED,
        Json(IssueResponse {
            name: req.name,
            token,
        }),
    ))
}

/// Request body for token revocation
#[derive(Debug, Deserialize)]
struct RevokeRequest {
    password: String,
}

/// Revoke an access token
async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<RevokeRequest>,
) -> Result<StatusCode, ApiError> {
    if req.password != state.admin_password {
        warn!(name = %name, "Revocation failed: invalid password");
        return Err((StatusCode::UNAUTHORIZED, "Invalid password".to_string()));
    }

    let removed = state
        .tokens
        .revoke(&name)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;

    if removed {
        info!(name = %name, "Token revoked");
        Ok(StatusCode::NO_CONTENT)
    } else {
        debug!(name = %name, "Revocation of unknown token");
        Err((StatusCode::NOT_FOUND, "Token not found".to_string()))
    }
}
