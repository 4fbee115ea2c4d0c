//! Gateway assembly: shared state, the combined listener (WebSocket RPC +
//! HTTP surfaces), the connect handshake, and lifecycle.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gatehouse_backup::{BackupOrchestrator, FsObjectStore};
use gatehouse_core::config::GatewayConfig;
use gatehouse_core::{AgentRunner, ConnId, EventSink, GatewayError, StateLayout};
use gatehouse_sched::SchedulerSupervisor;
use gatehouse_tenancy::{DiskUsageCache, QuotaGate, TenantRegistry, UsageLedger};
use gatehouse_term::{PtySpawner, TerminalManager};

use crate::authorize::scopes;
use crate::connection::{
    ConnectionHandle, ConnectionRecord, ConnectionRegistry, OUTBOUND_BUFFER, Role,
};
use crate::dispatch::{Dispatcher, RequestFrame, Responder};
use crate::handlers;
use crate::http::auth::constant_time_eq;
use crate::http::{compat, control};
use crate::metrics::MetricsCollector;

/// How long a fresh socket may take to send its connect frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Metrics sampling interval.
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Connect handshake parameters, carried in the first request frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectParams {
    /// Tenant token or gateway admin token.
    pub token: Option<String>,
    /// Explicit role; absence fails closed.
    pub role: Option<String>,
    /// Requested scopes.
    pub scopes: Option<Vec<String>>,
}

/// Shared gateway state.
pub struct Gateway {
    /// Loaded configuration.
    pub config: GatewayConfig,
    /// State-directory layout.
    pub layout: StateLayout,
    /// Tenant registry.
    pub registry: Arc<TenantRegistry>,
    /// Usage ledger.
    pub ledger: Arc<UsageLedger>,
    /// Pre-request quota gate.
    pub quota_gate: QuotaGate,
    /// Disk accounting cache.
    pub disk: Arc<DiskUsageCache>,
    /// Connected clients.
    pub connections: Arc<ConnectionRegistry>,
    /// PTY sessions.
    pub terminals: Arc<TerminalManager>,
    /// Scheduler supervisor.
    pub schedulers: Arc<SchedulerSupervisor>,
    /// Backup orchestrator.
    pub backups: Arc<BackupOrchestrator>,
    /// The agent execution pipeline.
    pub runner: Arc<dyn AgentRunner>,
    /// Counters and snapshot ring.
    pub metrics: Arc<MetricsCollector>,
    /// The RPC method table.
    pub dispatcher: Dispatcher,
}

impl Gateway {
    /// Assemble the gateway. Creates the state directory tree; binds
    /// nothing.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors creating the state directory.
    pub fn new(
        config: GatewayConfig,
        runner: Arc<dyn AgentRunner>,
        spawner: Arc<dyn PtySpawner>,
    ) -> std::io::Result<Arc<Self>> {
        let layout = config.layout();
        std::fs::create_dir_all(layout.tenants_dir())?;

        let registry = Arc::new(TenantRegistry::new(layout.clone()));
        let ledger = Arc::new(UsageLedger::new(layout.clone()));
        let quota_gate = QuotaGate::new(Arc::clone(&ledger));
        let disk = Arc::new(DiskUsageCache::new(layout.clone()));
        let connections = Arc::new(ConnectionRegistry::new());
        let sink: Arc<dyn EventSink> = Arc::clone(&connections) as _;

        let terminals = TerminalManager::new(spawner, Arc::clone(&sink));
        let schedulers = Arc::new(SchedulerSupervisor::new(
            layout.clone(),
            Arc::clone(&runner),
            Arc::clone(&sink),
            Arc::clone(&registry),
            config.scheduler.enabled,
        ));
        let backups = Arc::new(BackupOrchestrator::new(
            layout.clone(),
            Arc::new(FsObjectStore::new(config.backup_dir())),
            Arc::clone(&registry),
            config.backup.prefix.clone(),
        ));
        let metrics = Arc::new(MetricsCollector::new(layout.clone()));

        Ok(Arc::new(Self {
            config,
            layout,
            registry,
            ledger,
            quota_gate,
            disk,
            connections,
            terminals,
            schedulers,
            backups,
            runner,
            metrics,
            dispatcher: handlers::build_dispatcher(),
        }))
    }

    /// Resolve a connect handshake into a connection record.
    ///
    /// Fails closed: the role must be explicit, and some credential —
    /// tenant token or the configured admin token — must check out.
    ///
    /// # Errors
    ///
    /// `INVALID_REQUEST` for a missing/unknown role, `UNAUTHORIZED` for
    /// credential failures.
    pub fn resolve_connect(
        &self,
        params: &ConnectParams,
        remote_ip: Option<std::net::IpAddr>,
    ) -> Result<ConnectionRecord, GatewayError> {
        let role = params
            .role
            .as_deref()
            .ok_or_else(|| GatewayError::invalid_request("connect requires an explicit role"))?;
        let role = Role::parse(role)
            .ok_or_else(|| GatewayError::invalid_request(format!("unknown role: {role:?}")))?;

        let requested: HashSet<String> = params
            .scopes
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let Some(token) = params.token.as_deref() else {
            return Err(GatewayError::unauthorized("authentication required"));
        };

        if token.starts_with("tenant:") {
            let tenant = self
                .registry
                .validate_token(token)
                .map_err(|e| {
                    warn!(error = %e, "registry unavailable during connect");
                    GatewayError::unavailable("registry unavailable")
                })?
                .ok_or_else(|| GatewayError::unauthorized("invalid tenant token"))?;

            // Tenant connections never hold admin scope; default to
            // read/write when nothing specific was requested.
            let mut granted: HashSet<String> = if requested.is_empty() {
                HashSet::from([scopes::READ.to_string(), scopes::WRITE.to_string()])
            } else {
                requested
            };
            granted.remove(scopes::ADMIN);

            return Ok(ConnectionRecord {
                conn_id: ConnId::new(),
                tenant: Some(tenant),
                remote_ip,
                role,
                scopes: granted,
            });
        }

        if let Some(admin_token) = &self.config.auth.admin_token
            && constant_time_eq(token, admin_token)
        {
            let granted: HashSet<String> = if requested.is_empty() {
                [
                    scopes::ADMIN,
                    scopes::READ,
                    scopes::WRITE,
                    scopes::APPROVALS,
                    scopes::PAIRING,
                ]
                .iter()
                .map(|s| (*s).to_string())
                .collect()
            } else {
                requested
            };
            return Ok(ConnectionRecord {
                conn_id: ConnId::new(),
                tenant: None,
                remote_ip,
                role,
                scopes: granted,
            });
        }

        Err(GatewayError::unauthorized("invalid token"))
    }

    /// Spawn the metrics sampling loop.
    pub fn spawn_metrics_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                let tenants = gateway.registry.list().map(|t| t.len()).unwrap_or(0);
                let snapshot = gateway.metrics.sample(
                    gateway.connections.len(),
                    tenants,
                    gateway.terminals.session_count(),
                    gateway.schedulers.running_count(),
                    gateway.connections.dropped_events(),
                );
                gateway.metrics.store(snapshot);
            }
        })
    }

    /// Stop background work: schedulers, PTYs, connections.
    pub fn shutdown(&self) {
        self.schedulers.stop_all();
        let killed = self.terminals.close_all();
        self.connections.for_each_client(|handle| {
            self.connections.remove_client(handle.record().conn_id);
        });
        info!(ptys_killed = killed, "gateway shut down");
    }
}

/// Build the combined router: WebSocket upgrade plus both HTTP surfaces.
#[must_use]
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .merge(compat::compat_router())
        .merge(control::control_router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Bind and serve until SIGINT/SIGTERM, then shut the gateway down.
///
/// # Errors
///
/// Propagates bind and accept-loop failures.
pub async fn serve(gateway: Arc<Gateway>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(gateway.config.listen).await?;
    info!(addr = %gateway.config.listen, "gateway listening");

    if gateway.config.scheduler.enabled {
        gateway.schedulers.start_all();
    }
    let metrics_loop = gateway.spawn_metrics_loop();

    let app = router(Arc::clone(&gateway))
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    metrics_loop.abort();
    gateway.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(gateway, socket, addr))
}

/// Drive one WebSocket connection: handshake, then request dispatch until
/// close. Closing cancels the connection's outstanding request tasks.
async fn handle_socket(gateway: Arc<Gateway>, mut socket: WebSocket, addr: SocketAddr) {
    // ---- Handshake: first frame must be a connect request. ----
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await;
    let Ok(Some(Ok(Message::Text(raw)))) = first else {
        debug!(%addr, "socket closed before handshake");
        return;
    };
    let frame: RequestFrame = match serde_json::from_str(&raw) {
        Ok(frame) => frame,
        Err(_) => {
            let _ = socket
                .send(Message::Text(connect_reject(
                    Value::Null,
                    &GatewayError::invalid_request("malformed connect frame"),
                )))
                .await;
            return;
        },
    };
    if frame.method != "connect" {
        let _ = socket
            .send(Message::Text(connect_reject(
                frame.id,
                &GatewayError::invalid_request("first frame must be connect"),
            )))
            .await;
        return;
    }
    let params: ConnectParams = serde_json::from_value(frame.params).unwrap_or_default();
    let record = match gateway.resolve_connect(&params, Some(addr.ip())) {
        Ok(record) => record,
        Err(err) => {
            let _ = socket
                .send(Message::Text(connect_reject(frame.id, &err)))
                .await;
            return;
        },
    };

    let conn_id = record.conn_id;
    let accept_payload = json!({
        "connId": conn_id,
        "tenantId": record.tenant_id(),
        "scopes": record.scopes.iter().collect::<Vec<_>>(),
    });
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel(OUTBOUND_BUFFER);
    let handle = ConnectionHandle::new(record, outbound_tx);
    gateway.connections.add_client(handle.clone());

    let accept = Responder::new(handle.clone(), frame.id);
    accept.ok(accept_payload).await;

    // ---- Main loop. ----
    let (mut sink, mut stream) = socket.split();
    let mut request_tasks: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            // Eviction (tenant disabled/removed) or local close.
            () = handle.closed() => break,

            // Outbound frames.
            out = outbound_rx.recv() => {
                match out {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    },
                    None => break,
                }
            },

            // Inbound requests.
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        request_tasks.retain(|t| !t.is_finished());
                        if let Some(task) =
                            gateway.dispatcher.dispatch(&gateway, &handle, &text)
                        {
                            request_tasks.push(task);
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}, // ping/pong handled by the stack
                }
            },
        }
    }

    // Connection close cancels all outstanding handlers for this flow.
    for task in &request_tasks {
        task.abort();
    }
    gateway.connections.remove_client(conn_id);
    debug!(conn = %conn_id, "socket closed");
}

fn connect_reject(id: Value, err: &GatewayError) -> String {
    serde_json::to_string(&json!({
        "id": id,
        "ok": false,
        "error": err,
    }))
    .unwrap_or_default()
}
