//! RPC frames and the dispatcher.
//!
//! Frame shapes: requests `{id, method, params}`, responses
//! `{id, ok, payload?, error?, meta?}`, events `{event, payload}`, one
//! JSON text frame per message.
//!
//! Each request runs as its own task, so responses arrive in
//! handler-completion order within a connection; the server aborts a
//! connection's outstanding request tasks when it closes. The
//! [`Responder`] delivers at most one response per request; responding
//! after the connection is gone is a no-op.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use gatehouse_core::{GatewayError, GatewayResult};
use gatehouse_tenancy::{DenialReason, QuotaDecision};

use crate::authorize::authorize;
use crate::connection::ConnectionHandle;
use crate::server::Gateway;

/// An inbound request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, echoed into the response.
    #[serde(default)]
    pub id: Value,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// An outbound response frame.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFrame {
    /// Correlation id from the request.
    pub id: Value,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Structured error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    /// Out-of-band extras (soft-quota warnings).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// An outbound broadcast event frame.
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}

impl EventFrame {
    /// Build an event frame.
    #[must_use]
    pub fn new(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
        }
    }

    /// Serialize to a wire frame.
    #[must_use]
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"event\":\"?\"}"))
    }
}

/// At-most-once response delivery for one request.
#[derive(Clone)]
pub struct Responder {
    conn: ConnectionHandle,
    id: Value,
    meta: Option<Value>,
    sent: Arc<AtomicBool>,
}

impl Responder {
    /// Create a responder for a request id on a connection.
    #[must_use]
    pub fn new(conn: ConnectionHandle, id: Value) -> Self {
        Self {
            conn,
            id,
            meta: None,
            sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach response meta (delivered with either outcome).
    #[must_use]
    pub fn with_meta(mut self, meta: Option<Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Send a success response. Safe to call at most once; later calls and
    /// calls after the connection closed are no-ops.
    pub async fn ok(&self, payload: Value) {
        self.send(ResponseFrame {
            id: self.id.clone(),
            ok: true,
            payload: Some(payload),
            error: None,
            meta: self.meta.clone(),
        })
        .await;
    }

    /// Send an error response. Same contract as [`Self::ok`].
    pub async fn error(&self, error: GatewayError) {
        self.send(ResponseFrame {
            id: self.id.clone(),
            ok: false,
            payload: None,
            error: Some(error),
            meta: self.meta.clone(),
        })
        .await;
    }

    async fn send(&self, frame: ResponseFrame) {
        if self.sent.swap(true, Ordering::SeqCst) {
            debug!(id = %self.id, "suppressed duplicate response");
            return;
        }
        match serde_json::to_string(&frame) {
            Ok(text) => self.conn.send_frame(text).await,
            Err(e) => warn!(error = %e, "failed to serialize response frame"),
        }
    }
}

/// Context handed to a method handler.
pub struct RequestCtx {
    /// The calling connection.
    pub conn: ConnectionHandle,
    /// Request params.
    pub params: Value,
    /// The request's responder, for handlers that reply early and keep
    /// working. The dispatcher responds with the handler's return value
    /// otherwise; duplicate responses are suppressed.
    pub responder: Responder,
}

impl RequestCtx {
    /// Deserialize params into a typed shape.
    ///
    /// # Errors
    ///
    /// `INVALID_REQUEST` describing the mismatch.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> GatewayResult<T> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| GatewayError::invalid_request(format!("invalid params: {e}")))
    }
}

/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = GatewayResult<Value>> + Send>>;

/// A registered method handler.
pub type Handler = Arc<dyn Fn(Arc<Gateway>, RequestCtx) -> HandlerFuture + Send + Sync>;

/// The method table.
pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
    /// Tenant-scoped methods that pass through the quota gate.
    chargeable: HashSet<&'static str>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            chargeable: HashSet::from(["cron.run", "terminal.spawn"]),
        }
    }

    /// Register a handler.
    pub fn register<F, Fut>(&mut self, method: &'static str, handler: F)
    where
        F: Fn(Arc<Gateway>, RequestCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatewayResult<Value>> + Send + 'static,
    {
        self.handlers
            .insert(method, Arc::new(move |gw, ctx| Box::pin(handler(gw, ctx))));
    }

    /// Registered method names.
    #[must_use]
    pub fn methods(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Handle one inbound text frame. Spawns the handler and returns its
    /// task handle so the connection can cancel it on close.
    pub fn dispatch(
        &self,
        gateway: &Arc<Gateway>,
        conn: &ConnectionHandle,
        raw: &str,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let frame: RequestFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                // Unparseable frame: best-effort error with a null id.
                let responder = Responder::new(conn.clone(), Value::Null);
                let err = GatewayError::invalid_request(format!("malformed frame: {e}"));
                let handle = tokio::spawn(async move { responder.error(err).await });
                return Some(handle);
            },
        };

        gateway.metrics.record_request();
        let responder = Responder::new(conn.clone(), frame.id.clone());

        // Authorization is synchronous and cheap; run it before spawning.
        if let Err(err) = authorize(&frame.method, conn.record()) {
            let handle = tokio::spawn(async move { responder.error(err).await });
            return Some(handle);
        }

        // Quota gate for chargeable tenant methods.
        let mut meta = None;
        if let Some(tenant) = conn.record().tenant.clone()
            && self.chargeable.contains(frame.method.as_str())
        {
            match gateway
                .quota_gate
                .check_before_request(&tenant.tenant_id, &tenant.quotas)
            {
                Ok(QuotaDecision::Allowed { warning }) => {
                    meta = warning.map(|w| json!({ "warning": w }));
                },
                Ok(QuotaDecision::Denied {
                    reason,
                    message,
                    retry_after_ms,
                }) => {
                    let err = quota_denial_error(reason, &message, retry_after_ms);
                    let handle = tokio::spawn(async move { responder.error(err).await });
                    return Some(handle);
                },
                Err(e) => {
                    warn!(tenant = %tenant.tenant_id, error = %e, "quota check failed");
                    let err = GatewayError::unavailable("quota check failed");
                    let handle = tokio::spawn(async move { responder.error(err).await });
                    return Some(handle);
                },
            }
        }

        let Some(handler) = self.handlers.get(frame.method.as_str()) else {
            let err = GatewayError::not_found(format!("unknown method {}", frame.method));
            let handle = tokio::spawn(async move { responder.error(err).await });
            return Some(handle);
        };

        let handler = Arc::clone(handler);
        let gateway = Arc::clone(gateway);
        let conn = conn.clone();
        let responder = responder.with_meta(meta);
        let method = frame.method.clone();
        Some(tokio::spawn(async move {
            let ctx = RequestCtx {
                conn,
                params: frame.params,
                responder: responder.clone(),
            };
            // A handler panic must still produce a response.
            let outcome = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
                handler(gateway, ctx),
            ))
            .await;
            match outcome {
                Ok(Ok(payload)) => responder.ok(payload).await,
                Ok(Err(err)) => {
                    debug!(method = %method, code = %err.code, "handler error");
                    responder.error(err).await;
                },
                Err(_) => {
                    warn!(method = %method, "handler panicked");
                    responder
                        .error(GatewayError::unavailable(format!(
                            "internal error in {method}"
                        )))
                        .await;
                },
            }
        }))
    }
}

/// Map a quota denial to the wire error shape.
fn quota_denial_error(
    reason: DenialReason,
    message: &str,
    retry_after_ms: Option<u64>,
) -> GatewayError {
    match reason {
        DenialReason::RateLimited => {
            GatewayError::rate_limited(message, retry_after_ms.unwrap_or(1_000))
        },
        DenialReason::QuotaExceeded | DenialReason::DiskFull | DenialReason::SessionsExceeded => {
            GatewayError::invalid_request(message).with_details(json!({ "reason": reason }))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionRecord, Role};
    use gatehouse_core::ConnId;
    use tokio::sync::mpsc;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let record = ConnectionRecord {
            conn_id: ConnId::new(),
            tenant: None,
            remote_ip: None,
            role: Role::Operator,
            scopes: std::collections::HashSet::new(),
        };
        (ConnectionHandle::new(record, tx), rx)
    }

    #[tokio::test]
    async fn responder_sends_at_most_once() {
        let (conn, mut rx) = handle();
        let responder = Responder::new(conn, json!("req-1"));
        responder.ok(json!({"first": true})).await;
        responder.ok(json!({"second": true})).await;
        responder.error(GatewayError::unavailable("late")).await;

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], "req-1");
        assert_eq!(frame["ok"], true);
        assert_eq!(frame["payload"]["first"], true);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn responder_after_close_is_noop() {
        let (conn, mut rx) = handle();
        conn.close();
        let responder = Responder::new(conn, json!(7));
        responder.ok(json!({})).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn quota_denials_map_to_wire_errors() {
        let err = quota_denial_error(DenialReason::RateLimited, "slow down", Some(30_000));
        assert_eq!(err.retry_after_ms, Some(30_000));

        let err = quota_denial_error(DenialReason::DiskFull, "disk", None);
        assert_eq!(err.code, gatehouse_core::ErrorCode::InvalidRequest);
        assert_eq!(err.details.as_ref().unwrap()["reason"], "disk_full");
    }

    #[test]
    fn event_frame_wire_shape() {
        let frame = EventFrame::new("tenant:demo:cron", json!({"jobId": "j1"}));
        let value: Value = serde_json::from_str(&frame.serialize()).unwrap();
        assert_eq!(value["event"], "tenant:demo:cron");
        assert_eq!(value["payload"]["jobId"], "j1");
    }

    #[test]
    fn request_frame_defaults() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"method": "health"}"#).unwrap();
        assert_eq!(frame.id, Value::Null);
        assert_eq!(frame.method, "health");
        assert_eq!(frame.params, Value::Null);
    }
}
