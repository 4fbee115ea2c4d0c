//! The internal control plane under `/internal/v1`.
//!
//! Authenticated with `X-Control-Plane-Token`, compared in constant time
//! against the configured secret; no configured secret denies everything.
//! JSON in, JSON out, 64 KiB body cap, 404 for unknown paths under the
//! prefix, 405 for disallowed methods.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use gatehouse_backup::{BackupError, ObjectStoreError};
use gatehouse_tenancy::TenancyError;

use crate::handlers::teardown_tenant;
use crate::http::auth::{check_control_token, http_error};
use crate::server::Gateway;

/// Body cap for the control plane.
const CONTROL_BODY_LIMIT: usize = 64 * 1024;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CreateTenantBody {
    display_name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DeleteTenantQuery {
    delete_data: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct BackupBody {
    key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreBody {
    key: String,
    #[serde(default)]
    create_if_missing: bool,
}

/// Routes for the control plane, nested under `/internal/v1`.
pub fn control_router() -> Router<Arc<Gateway>> {
    let inner = Router::new()
        .route("/status", get(status))
        .route(
            "/tenants/:tenant_id",
            get(get_tenant).post(create_tenant).delete(delete_tenant),
        )
        .route("/tenants/:tenant_id/backup", post(trigger_backup))
        .route("/tenants/:tenant_id/restore", post(trigger_restore))
        .route("/tenants/:tenant_id/backups", get(list_backups))
        .route(
            "/tenants/:tenant_id/backups/*key",
            axum::routing::delete(delete_backup),
        )
        .fallback(|| async {
            http_error(StatusCode::NOT_FOUND, "not_found", "unknown control-plane path")
        });
    Router::new()
        .nest("/internal/v1", inner)
        .layer(DefaultBodyLimit::max(CONTROL_BODY_LIMIT))
}

fn tenancy_response(err: &TenancyError) -> Response {
    match err {
        TenancyError::InvalidTenantId(_) | TenancyError::TenantExists(_) => {
            http_error(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
        },
        TenancyError::TenantNotFound(_) => {
            http_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        },
        TenancyError::Io { .. } | TenancyError::Serialize(_) => http_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}

fn backup_response(err: &BackupError) -> Response {
    match err {
        BackupError::TenantNotFound(_)
        | BackupError::StateDirMissing(_)
        | BackupError::Store(ObjectStoreError::NotFound(_)) => {
            http_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        },
        BackupError::Store(ObjectStoreError::InvalidKey(_)) => {
            http_error(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
        },
        BackupError::Tenancy(e) => tenancy_response(e),
        _ => http_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}

async fn status(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    let tenant_count = gateway.registry.list().map(|t| t.len()).unwrap_or(0);
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["tenants", "backups", "terminals", "cron", "chat-compat"],
        "tenantCount": tenant_count,
        "uptimeSecs": gateway.metrics.uptime_secs(),
        "connections": gateway.connections.len(),
        "ptySessions": gateway.terminals.session_count(),
        "requestsDispatched": gateway.metrics.requests_dispatched(),
        "metrics": gateway.metrics.current(),
    }))
    .into_response()
}

async fn get_tenant(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    match gateway.registry.get(&tenant_id) {
        Ok(Some(record)) => Json(json!({
            "tenantId": tenant_id,
            "displayName": record.display_name,
            "disabled": record.disabled,
            "createdAt": record.created_at,
            "lastSeenAt": record.last_seen_at,
            "quotas": record.quotas,
        }))
        .into_response(),
        Ok(None) => http_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("tenant not found: {tenant_id}"),
        ),
        Err(e) => tenancy_response(&e),
    }
}

async fn create_tenant(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    body: Option<Json<CreateTenantBody>>,
) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    let display_name = body.and_then(|Json(b)| b.display_name);
    match gateway.registry.create(&tenant_id, display_name) {
        Ok((record, token)) => (
            StatusCode::CREATED,
            Json(json!({
                "tenantId": tenant_id,
                "displayName": record.display_name,
                "createdAt": record.created_at,
                "token": token,
            })),
        )
            .into_response(),
        Err(e) => tenancy_response(&e),
    }
}

async fn delete_tenant(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(query): Query<DeleteTenantQuery>,
) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    teardown_tenant(&gateway, &tenant_id);
    match gateway.registry.remove(&tenant_id, query.delete_data) {
        Ok(()) => Json(json!({ "removed": tenant_id })).into_response(),
        Err(e) => tenancy_response(&e),
    }
}

async fn trigger_backup(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    body: Option<Json<BackupBody>>,
) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    let key = body.and_then(|Json(b)| b.key);
    match gateway.backups.backup(&tenant_id, key).await {
        Ok(info) => Json(json!(info)).into_response(),
        Err(e) => backup_response(&e),
    }
}

async fn trigger_restore(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    match gateway
        .backups
        .restore(&tenant_id, &body.key, body.create_if_missing)
        .await
    {
        Ok(report) => Json(json!({
            "extracted": report.extracted,
            "skipped": report.skipped,
        }))
        .into_response(),
        Err(e) => backup_response(&e),
    }
}

async fn list_backups(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    match gateway.backups.list_backups(&tenant_id).await {
        Ok(backups) => Json(json!({ "backups": backups })).into_response(),
        Err(e) => backup_response(&e),
    }
}

async fn delete_backup(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path((_tenant_id, key)): Path<(String, String)>,
) -> Response {
    if let Err(denied) = check_control_token(&gateway, &headers) {
        return denied;
    }
    match gateway.backups.delete_backup(&key).await {
        Ok(()) => Json(json!({ "deleted": key })).into_response(),
        Err(e) => backup_response(&e),
    }
}
