//! Admin surface for key management
//!
//! Mounted on the main listener under `/admin`. Responses are JSON and never
//! carry key secrets; listings show masked previews only.
//!
//! Endpoints:
//! - GET    /admin/keys              — list keys with status and counters
//! - POST   /admin/keys              — add one key
//! - POST   /admin/keys/import       — bulk import, duplicates skipped
//! - PATCH  /admin/keys/{id}         — update name/weight/max_errors
//! - DELETE /admin/keys/{id}         — remove a key
//! - POST   /admin/keys/{id}/status  — force a status
//! - POST   /admin/keys/{id}/reset   — clear the error counter
//! - GET    /admin/logs              — query the audit log
//! - GET    /admin/quotas            — per-key usage for a period
//! - GET    /admin/pool              — pool status summary
//! - GET/PUT /admin/settings         — persisted runtime overrides

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, StatusCode};
use axum::routing::{get, post};
use dispatch::DispatchEngine;
use keypool::KeyPool;
use keystore::{KeyStatus, LogQuery, NewKey, UpdateKey, current_period};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

const MAX_LOG_PAGE: usize = 100;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<KeyPool>,
    engine: Arc<DispatchEngine>,
}

impl AdminState {
    pub fn new(pool: Arc<KeyPool>, engine: Arc<DispatchEngine>) -> Self {
        Self { pool, engine }
    }
}

/// Build the admin axum router with all key management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys).post(create_key))
        .route("/admin/keys/import", post(import_keys))
        .route("/admin/keys/{id}", axum::routing::patch(update_key).delete(delete_key))
        .route("/admin/keys/{id}/status", post(set_key_status))
        .route("/admin/keys/{id}/reset", post(reset_key_errors))
        .route("/admin/logs", get(query_logs))
        .route("/admin/quotas", get(list_quotas))
        .route("/admin/pool", get(pool_status))
        .route("/admin/settings", get(show_settings).put(update_settings))
        .with_state(state)
}

type JsonReply = (StatusCode, [(HeaderName, &'static str); 1], String);

fn reply(status: StatusCode, body: Value) -> JsonReply {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

fn error_reply(e: keypool::Error) -> JsonReply {
    let status = match &e {
        keypool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        keypool::Error::Store(keystore::Error::KeyNotFound(_)) => StatusCode::NOT_FOUND,
        keypool::Error::Store(keystore::Error::DuplicateKey) => StatusCode::CONFLICT,
        keypool::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    reply(status, json!({ "error": e.to_string() }))
}

async fn list_keys(State(state): State<AdminState>) -> JsonReply {
    let keys = state.pool.views().await;
    reply(StatusCode::OK, json!({ "keys": keys }))
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    key: String,
    display_name: Option<String>,
    weight: Option<u32>,
    max_errors: Option<u32>,
}

async fn create_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CreateKeyRequest>,
) -> JsonReply {
    let new = NewKey {
        key_value: body.key,
        display_name: body.display_name,
        weight: body.weight,
        max_errors: body.max_errors,
    };
    match state.pool.add_key(new).await {
        Ok(view) => reply(StatusCode::CREATED, json!({ "key": view })),
        Err(e) => error_reply(e),
    }
}

#[derive(Deserialize)]
struct ImportRequest {
    keys: Vec<String>,
}

async fn import_keys(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<ImportRequest>,
) -> JsonReply {
    let keys: Vec<NewKey> = body
        .keys
        .into_iter()
        .map(|key_value| NewKey {
            key_value,
            display_name: None,
            weight: None,
            max_errors: None,
        })
        .collect();
    match state.pool.import_keys(keys).await {
        Ok(imported) => reply(StatusCode::OK, json!({ "imported": imported })),
        Err(e) => error_reply(e),
    }
}

#[derive(Deserialize)]
struct UpdateKeyRequest {
    display_name: Option<String>,
    weight: Option<u32>,
    max_errors: Option<u32>,
}

async fn update_key(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    axum::Json(body): axum::Json<UpdateKeyRequest>,
) -> JsonReply {
    let updates = UpdateKey {
        display_name: body.display_name,
        weight: body.weight,
        max_errors: body.max_errors,
    };
    match state.pool.update_key(id, updates).await {
        Ok(view) => reply(StatusCode::OK, json!({ "key": view })),
        Err(e) => error_reply(e),
    }
}

async fn delete_key(State(state): State<AdminState>, Path(id): Path<u64>) -> JsonReply {
    match state.pool.delete_key(id).await {
        Ok(()) => reply(StatusCode::OK, json!({ "deleted": id })),
        Err(e) => error_reply(e),
    }
}

#[derive(Deserialize)]
struct SetStatusRequest {
    status: KeyStatus,
}

async fn set_key_status(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    axum::Json(body): axum::Json<SetStatusRequest>,
) -> JsonReply {
    match state.pool.set_status(id, body.status).await {
        Ok(view) => reply(StatusCode::OK, json!({ "key": view })),
        Err(e) => error_reply(e),
    }
}

async fn reset_key_errors(State(state): State<AdminState>, Path(id): Path<u64>) -> JsonReply {
    match state.pool.reset_errors(id).await {
        Ok(view) => reply(StatusCode::OK, json!({ "key": view })),
        Err(e) => error_reply(e),
    }
}

#[derive(Deserialize)]
struct LogsRequest {
    page: Option<usize>,
    limit: Option<usize>,
    start_date: Option<String>,
    end_date: Option<String>,
    operation: Option<String>,
    key_id: Option<u64>,
    status: Option<String>,
    keyword: Option<String>,
}

async fn query_logs(
    State(state): State<AdminState>,
    Query(params): Query<LogsRequest>,
) -> JsonReply {
    let query = LogQuery {
        page: params.page.unwrap_or(1).max(1),
        limit: params.limit.unwrap_or(20).min(MAX_LOG_PAGE),
        start_date: params.start_date,
        end_date: params.end_date,
        operation: params.operation,
        key_id: params.key_id,
        status: params.status,
        keyword: params.keyword,
    };
    let page = state.pool.store().query_logs(&query).await;
    reply(
        StatusCode::OK,
        json!({ "total": page.total, "logs": page.logs }),
    )
}

#[derive(Deserialize)]
struct QuotasRequest {
    period: Option<String>,
}

async fn list_quotas(
    State(state): State<AdminState>,
    Query(params): Query<QuotasRequest>,
) -> JsonReply {
    let period = params.period.unwrap_or_else(current_period);
    let quotas = state.pool.store().quotas_for_period(&period).await;
    reply(
        StatusCode::OK,
        json!({ "period": period, "quotas": quotas }),
    )
}

async fn pool_status(State(state): State<AdminState>) -> JsonReply {
    reply(StatusCode::OK, state.pool.health().await)
}

async fn show_settings(State(state): State<AdminState>) -> JsonReply {
    let settings = state.pool.store().all_config().await;
    reply(StatusCode::OK, json!({ "settings": settings }))
}

#[derive(Deserialize)]
struct SettingsRequest {
    max_concurrent: Option<usize>,
}

/// Runtime overrides. Applied immediately and persisted to the config table
/// so they survive a restart.
async fn update_settings(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<SettingsRequest>,
) -> JsonReply {
    if let Some(limit) = body.max_concurrent {
        if limit == 0 {
            return reply(
                StatusCode::BAD_REQUEST,
                json!({ "error": "max_concurrent must be greater than 0" }),
            );
        }
        state.engine.set_max_concurrent(limit).await;
        if let Err(e) = state
            .pool
            .store()
            .set_config("max_concurrent", &limit.to_string())
            .await
        {
            warn!(error = %e, "failed to persist max_concurrent override");
        }
    }
    let settings = state.pool.store().all_config().await;
    reply(StatusCode::OK, json!({ "settings": settings }))
}
