//! Bearer and control-plane token resolution.

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use subtle::ConstantTimeEq;

use gatehouse_tenancy::TenantContext;

use crate::server::Gateway;

/// Header carrying the control-plane secret.
pub const CONTROL_PLANE_HEADER: &str = "x-control-plane-token";

/// Resolved identity of an HTTP caller.
#[derive(Debug, Clone)]
pub struct HttpIdentity {
    /// Tenant context for tenant-token callers.
    pub tenant: Option<TenantContext>,
    /// Whether the caller presented the gateway admin token.
    pub admin: bool,
}

impl HttpIdentity {
    /// The tenant id, if tenant-authenticated.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_ref().map(|t| t.tenant_id.as_str())
    }
}

/// Build the JSON error body both HTTP surfaces use.
#[must_use]
pub fn http_error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": { "type": kind, "message": message.into() }
        })),
    )
        .into_response()
}

/// Constant-time string equality.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Resolve the `Authorization: Bearer` identity for the `/v1` surface.
///
/// Tenant tokens resolve through the registry (constant-time secret
/// check); any other value must match the configured gateway admin token,
/// compared in constant time.
///
/// # Errors
///
/// A ready-to-return `401` response.
pub fn resolve_bearer(gateway: &Gateway, headers: &HeaderMap) -> Result<HttpIdentity, Response> {
    let unauthorized =
        || http_error(StatusCode::UNAUTHORIZED, "invalid_api_key", "invalid or missing bearer token");

    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(unauthorized());
    };
    let Ok(value) = value.to_str() else {
        return Err(unauthorized());
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(unauthorized());
    };

    if token.starts_with("tenant:") {
        match gateway.registry.validate_token(token) {
            Ok(Some(ctx)) => {
                return Ok(HttpIdentity {
                    tenant: Some(ctx),
                    admin: false,
                });
            },
            Ok(None) => return Err(unauthorized()),
            Err(e) => {
                tracing::warn!(error = %e, "registry unavailable during bearer auth");
                return Err(http_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "registry unavailable",
                ));
            },
        }
    }

    if let Some(admin_token) = &gateway.config.auth.admin_token
        && constant_time_eq(token, admin_token)
    {
        return Ok(HttpIdentity {
            tenant: None,
            admin: true,
        });
    }
    Err(unauthorized())
}

/// Verify the control-plane token header. An unset secret denies all.
///
/// # Errors
///
/// A ready-to-return `401` response.
pub fn check_control_token(gateway: &Gateway, headers: &HeaderMap) -> Result<(), Response> {
    let denied = || {
        http_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid control-plane token",
        )
    };
    let Some(expected) = &gateway.config.control_plane.token else {
        return Err(denied());
    };
    let Some(presented) = headers.get(CONTROL_PLANE_HEADER).and_then(|v| v.to_str().ok()) else {
        return Err(denied());
    };
    if constant_time_eq(presented, expected) {
        Ok(())
    } else {
        Err(denied())
    }
}
