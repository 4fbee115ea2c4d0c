//! OpenAI-compatible endpoints.
//!
//! `POST /v1/chat/completions` and `POST /v1/responses` accept a bearer
//! token and an optional caller-supplied session key (the OpenAI `user`
//! field). Tenant callers have every session key forced through the
//! session-key scoping chokepoint *before* the agent runner is touched; a
//! foreign tenant prefix is a 403. `POST /v1/tools/invoke` rejects tenant
//! tokens outright.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use gatehouse_core::{ChatMessage, RunInput, RunnerError, scope_session_key_to_tenant};
use gatehouse_tenancy::{DenialReason, QuotaDecision, TokenDelta};

use crate::http::auth::{HttpIdentity, http_error, resolve_bearer};
use crate::server::Gateway;

/// Body cap for the compat surface.
const COMPAT_BODY_LIMIT: usize = 1024 * 1024;

/// Session key used when the caller supplies none.
const DEFAULT_SESSION_KEY: &str = "agent:main:openai:chat";

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Deserialize)]
struct ResponsesRequest {
    #[serde(default)]
    model: Option<String>,
    input: Value,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Deserialize)]
struct ToolInvokeRequest {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    user: Option<String>,
}

/// Routes for the `/v1` surface.
pub fn compat_router() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/tools/invoke", post(invoke_tool))
        .layer(DefaultBodyLimit::max(COMPAT_BODY_LIMIT))
}

/// Scope the caller-supplied session key, then run the quota gate.
///
/// Returns the effective session key, or a ready-to-return error response.
fn admit(
    gateway: &Gateway,
    identity: &HttpIdentity,
    requested_key: Option<&str>,
) -> Result<String, Response> {
    let raw_key = requested_key.unwrap_or(DEFAULT_SESSION_KEY);
    let session_key = scope_session_key_to_tenant(raw_key, identity.tenant_id())
        .map_err(|e| http_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()))?;

    if let Some(tenant) = &identity.tenant {
        match gateway
            .quota_gate
            .check_before_request(&tenant.tenant_id, &tenant.quotas)
        {
            Ok(QuotaDecision::Allowed { .. }) => {},
            Ok(QuotaDecision::Denied {
                reason,
                message,
                retry_after_ms,
            }) => return Err(quota_response(reason, &message, retry_after_ms)),
            Err(e) => {
                tracing::warn!(tenant = %tenant.tenant_id, error = %e, "quota check failed");
                return Err(http_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "quota check failed",
                ));
            },
        }
    }
    Ok(session_key)
}

fn quota_response(reason: DenialReason, message: &str, retry_after_ms: Option<u64>) -> Response {
    match reason {
        DenialReason::RateLimited => {
            let mut response =
                http_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message);
            if let Some(ms) = retry_after_ms {
                let secs = ms.div_ceil(1_000).max(1);
                if let Ok(value) = secs.to_string().parse() {
                    response.headers_mut().insert("retry-after", value);
                }
            }
            response
        },
        DenialReason::QuotaExceeded => {
            http_error(StatusCode::FORBIDDEN, "quota_exceeded", message)
        },
        DenialReason::DiskFull => http_error(StatusCode::FORBIDDEN, "disk_full", message),
        DenialReason::SessionsExceeded => {
            http_error(StatusCode::FORBIDDEN, "sessions_exceeded", message)
        },
    }
}

fn runner_response(err: &RunnerError) -> Response {
    match err {
        RunnerError::Timeout(_) => {
            http_error(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string())
        },
        RunnerError::Unavailable(_) | RunnerError::Unsupported(_) => {
            http_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
        },
    }
}

/// Record token usage for tenant callers. Best effort.
fn record_usage(gateway: &Gateway, identity: &HttpIdentity, input: u64, output: u64) {
    if let Some(tenant) = &identity.tenant {
        let delta = TokenDelta {
            input_tokens: input,
            output_tokens: output,
            messages: 1,
            ..TokenDelta::default()
        };
        if let Err(e) = gateway.ledger.update_token_usage(&tenant.tenant_id, delta) {
            tracing::warn!(tenant = %tenant.tenant_id, error = %e, "failed to record usage");
        }
    }
}

/// Mark a tenant session active (or finished) around a runner invocation,
/// so the concurrent-session cap sees in-flight completions. Best effort.
fn mark_session(gateway: &Gateway, identity: &HttpIdentity, started: bool) {
    if let Some(tenant) = &identity.tenant
        && let Err(e) = gateway
            .ledger
            .update_session_count(&tenant.tenant_id, started)
    {
        tracing::warn!(tenant = %tenant.tenant_id, error = %e, "failed to update session count");
    }
}

async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Response {
    let identity = match resolve_bearer(&gateway, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    if body.messages.is_empty() {
        return http_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "messages must not be empty",
        );
    }
    let session_key = match admit(&gateway, &identity, body.user.as_deref()) {
        Ok(key) => key,
        Err(response) => return response,
    };

    mark_session(&gateway, &identity, true);
    let result = gateway
        .runner
        .run(
            &session_key,
            RunInput {
                messages: body.messages,
                agent_id: None,
            },
        )
        .await;
    mark_session(&gateway, &identity, false);

    match result {
        Ok(out) => {
            record_usage(&gateway, &identity, out.input_tokens, out.output_tokens);
            let total = out.input_tokens.saturating_add(out.output_tokens);
            Json(json!({
                "id": format!("chatcmpl-{}", Uuid::new_v4()),
                "object": "chat.completion",
                "created": chrono::Utc::now().timestamp(),
                "model": body.model.unwrap_or_else(|| "gatehouse".to_string()),
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": out.text },
                    "finish_reason": "stop",
                }],
                "usage": {
                    "prompt_tokens": out.input_tokens,
                    "completion_tokens": out.output_tokens,
                    "total_tokens": total,
                },
            }))
            .into_response()
        },
        Err(err) => runner_response(&err),
    }
}

async fn responses(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(body): Json<ResponsesRequest>,
) -> Response {
    let identity = match resolve_bearer(&gateway, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let messages = match input_messages(&body.input) {
        Ok(messages) => messages,
        Err(message) => {
            return http_error(StatusCode::BAD_REQUEST, "invalid_request_error", message);
        },
    };
    let session_key = match admit(&gateway, &identity, body.user.as_deref()) {
        Ok(key) => key,
        Err(response) => return response,
    };

    mark_session(&gateway, &identity, true);
    let result = gateway
        .runner
        .run(
            &session_key,
            RunInput {
                messages,
                agent_id: None,
            },
        )
        .await;
    mark_session(&gateway, &identity, false);

    match result {
        Ok(out) => {
            record_usage(&gateway, &identity, out.input_tokens, out.output_tokens);
            let total = out.input_tokens.saturating_add(out.output_tokens);
            Json(json!({
                "id": format!("resp_{}", Uuid::new_v4().simple()),
                "object": "response",
                "created_at": chrono::Utc::now().timestamp(),
                "model": body.model.unwrap_or_else(|| "gatehouse".to_string()),
                "output": [{
                    "type": "message",
                    "role": "assistant",
                    "content": [{ "type": "output_text", "text": out.text }],
                }],
                "usage": {
                    "input_tokens": out.input_tokens,
                    "output_tokens": out.output_tokens,
                    "total_tokens": total,
                },
            }))
            .into_response()
        },
        Err(err) => runner_response(&err),
    }
}

async fn invoke_tool(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(body): Json<ToolInvokeRequest>,
) -> Response {
    let identity = match resolve_bearer(&gateway, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    // Tool invocation is never available to tenant tokens, full stop.
    if identity.tenant.is_some() {
        return http_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "tool invocation is not available for tenant tokens",
        );
    }
    if !identity.admin {
        return http_error(StatusCode::FORBIDDEN, "forbidden", "admin token required");
    }

    let session_key = body.user.as_deref().unwrap_or(DEFAULT_SESSION_KEY);
    match gateway
        .runner
        .invoke_tool(session_key, &body.tool, body.args)
        .await
    {
        Ok(result) => Json(json!({ "tool": body.tool, "result": result })).into_response(),
        Err(err) => runner_response(&err),
    }
}

/// Accept either a plain string or an array of chat messages.
fn input_messages(input: &Value) -> Result<Vec<ChatMessage>, String> {
    match input {
        Value::String(text) => Ok(vec![ChatMessage {
            role: "user".to_string(),
            content: text.clone(),
        }]),
        Value::Array(_) => serde_json::from_value(input.clone())
            .map_err(|e| format!("invalid input messages: {e}")),
        _ => Err("input must be a string or an array of messages".to_string()),
    }
}
