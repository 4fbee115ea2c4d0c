//! Connected clients and broadcast fan-out.
//!
//! Each WebSocket client gets a [`ConnectionHandle`]: immutable handshake
//! metadata plus a bounded outbound channel. Broadcast copies the handle
//! list before iterating and never awaits; a full buffer drops
//! `drop_if_slow` events and detaches a task for reliable ones, so a slow
//! or stuck consumer cannot stall the broadcaster.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use gatehouse_core::{ConnId, EventSink};
use gatehouse_tenancy::TenantContext;

use crate::dispatch::EventFrame;

/// Outbound buffer depth per connection.
pub const OUTBOUND_BUFFER: usize = 256;

/// Connection roles, assigned at the connect handshake. No implicit
/// default: a handshake without an explicit role fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A human or automation operator client.
    Operator,
    /// A paired worker node.
    Node,
}

impl Role {
    /// Parse a handshake role string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "operator" => Some(Self::Operator),
            "node" => Some(Self::Node),
            _ => None,
        }
    }
}

/// Immutable metadata captured at the connect handshake.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Unique per connection lifetime.
    pub conn_id: ConnId,
    /// Tenant context when authenticated with a tenant token.
    pub tenant: Option<TenantContext>,
    /// Source address, when known.
    pub remote_ip: Option<IpAddr>,
    /// Handshake role.
    pub role: Role,
    /// Granted scopes.
    pub scopes: HashSet<String>,
}

impl ConnectionRecord {
    /// The authenticated tenant id, if any.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_ref().map(|t| t.tenant_id.as_str())
    }

    /// Whether the connection holds a scope (admin implies everything).
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(crate::authorize::scopes::ADMIN) || self.scopes.contains(scope)
    }

    /// Whether the connection holds admin scope.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.scopes.contains(crate::authorize::scopes::ADMIN)
    }
}

struct ConnInner {
    record: ConnectionRecord,
    outbound: mpsc::Sender<String>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Cheap-to-clone handle to one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnInner>,
}

impl ConnectionHandle {
    /// Create a handle around an outbound channel sender.
    #[must_use]
    pub fn new(record: ConnectionRecord, outbound: mpsc::Sender<String>) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                record,
                outbound,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
        }
    }

    /// Handshake metadata.
    #[must_use]
    pub fn record(&self) -> &ConnectionRecord {
        &self.inner.record
    }

    /// Whether the connection has been closed or evicted.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Mark closed and wake the socket task.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.close_notify.notify_waiters();
    }

    /// Wait until [`Self::close`] is called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.close_notify.notified().await;
    }

    /// Reliable send: awaits buffer space. Sending to a closed connection
    /// is a no-op.
    pub async fn send_frame(&self, frame: String) {
        if self.is_closed() {
            return;
        }
        let _ = self.inner.outbound.send(frame).await;
    }

    /// Non-blocking send. Returns `false` when the frame was dropped
    /// (buffer full or connection gone).
    pub fn try_send_frame(&self, frame: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.outbound.try_send(frame).is_ok()
    }
}

/// The set of connected clients.
pub struct ConnectionRegistry {
    clients: DashMap<ConnId, ConnectionHandle>,
    /// Events discarded because a slow consumer's buffer was full.
    dropped_events: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Register a connection.
    pub fn add_client(&self, handle: ConnectionHandle) {
        let record = handle.record();
        info!(
            conn = %record.conn_id,
            tenant = record.tenant_id().unwrap_or("-"),
            role = ?record.role,
            "client connected"
        );
        self.clients.insert(record.conn_id, handle);
    }

    /// Remove a connection.
    pub fn remove_client(&self, conn_id: ConnId) {
        if let Some((_, handle)) = self.clients.remove(&conn_id) {
            handle.close();
            debug!(conn = %conn_id, "client removed");
        }
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, conn_id: ConnId) -> Option<ConnectionHandle> {
        self.clients.get(&conn_id).map(|h| h.value().clone())
    }

    /// Visit every connection. The handle list is copied first, so
    /// callbacks may mutate the registry.
    pub fn for_each_client(&self, mut visit: impl FnMut(&ConnectionHandle)) {
        for handle in self.snapshot() {
            visit(&handle);
        }
    }

    /// Connections originating from an IP.
    #[must_use]
    pub fn clients_by_ip(&self, ip: IpAddr) -> HashSet<ConnId> {
        self.clients
            .iter()
            .filter(|entry| entry.value().record().remote_ip == Some(ip))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Whether any client — tenant or not — connected from this IP.
    #[must_use]
    pub fn has_authorized_client_for_ip(&self, ip: IpAddr) -> bool {
        self.clients
            .iter()
            .any(|entry| entry.value().record().remote_ip == Some(ip))
    }

    /// Evict every connection authenticated as a tenant. Used when the
    /// tenant is disabled or removed. Returns the number evicted.
    pub fn evict_tenant(&self, tenant_id: &str) -> usize {
        let ids: Vec<ConnId> = self
            .clients
            .iter()
            .filter(|entry| entry.value().record().tenant_id() == Some(tenant_id))
            .map(|entry| *entry.key())
            .collect();
        for id in &ids {
            self.remove_client(*id);
        }
        if !ids.is_empty() {
            info!(tenant = %tenant_id, evicted = ids.len(), "evicted tenant connections");
        }
        ids.len()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Total events dropped to protect slow consumers.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    fn deliver(&self, handle: &ConnectionHandle, frame: &str, drop_if_slow: bool) {
        if drop_if_slow {
            if !handle.try_send_frame(frame.to_string()) {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                debug!(conn = %handle.record().conn_id, "dropped event for slow consumer");
            }
            return;
        }
        // Reliable event: never stall the broadcaster; push the wait onto
        // a detached task when the buffer is full.
        if !handle.try_send_frame(frame.to_string()) {
            let handle = handle.clone();
            let frame = frame.to_string();
            tokio::spawn(async move { handle.send_frame(frame).await });
        }
    }
}

impl EventSink for ConnectionRegistry {
    fn broadcast(&self, event: &str, payload: Value, drop_if_slow: bool) {
        let frame = EventFrame::new(event, payload).serialize();
        for handle in self.snapshot() {
            self.deliver(&handle, &frame, drop_if_slow);
        }
    }

    fn send_to(&self, conn_ids: &[ConnId], event: &str, payload: Value, drop_if_slow: bool) {
        let frame = EventFrame::new(event, payload).serialize();
        for conn_id in conn_ids {
            if let Some(handle) = self.get(*conn_id) {
                self.deliver(&handle, &frame, drop_if_slow);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(tenant: Option<&str>, ip: Option<IpAddr>) -> ConnectionRecord {
        ConnectionRecord {
            conn_id: ConnId::new(),
            tenant: tenant.map(|t| TenantContext {
                tenant_id: t.to_string(),
                state_dir: std::path::PathBuf::from("/tmp"),
                display_name: None,
                quotas: gatehouse_tenancy::Quotas::default(),
            }),
            remote_ip: ip,
            role: Role::Operator,
            scopes: HashSet::from(["operator.read".to_string()]),
        }
    }

    fn connect(
        registry: &ConnectionRegistry,
        tenant: Option<&str>,
        ip: Option<IpAddr>,
        buffer: usize,
    ) -> (ConnId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = ConnectionHandle::new(record(tenant, ip), tx);
        let conn_id = handle.record().conn_id;
        registry.add_client(handle);
        (conn_id, rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx_a) = connect(&registry, None, None, 8);
        let (_, mut rx_b) = connect(&registry, Some("t1"), None, 8);

        registry.broadcast("ping", json!({"n": 1}), false);

        for rx in [&mut rx_a, &mut rx_b] {
            let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["event"], "ping");
            assert_eq!(frame["payload"]["n"], 1);
        }
    }

    #[tokio::test]
    async fn send_to_targets_only_listed_connections() {
        let registry = ConnectionRegistry::new();
        let (id_a, mut rx_a) = connect(&registry, None, None, 8);
        let (_, mut rx_b) = connect(&registry, None, None, 8);

        registry.send_to(&[id_a], "only-a", json!({}), true);

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_if_slow_discards_on_full_buffer() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx) = connect(&registry, None, None, 1);

        registry.broadcast("e1", json!({}), true);
        registry.broadcast("e2", json!({}), true);
        assert_eq!(registry.dropped_events(), 1);

        // The buffered frame is still intact.
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "e1");
    }

    #[tokio::test]
    async fn evict_tenant_removes_and_closes() {
        let registry = ConnectionRegistry::new();
        let (tenant_conn, _rx_a) = connect(&registry, Some("t1"), None, 8);
        let (other_conn, _rx_b) = connect(&registry, Some("t2"), None, 8);
        let handle = registry.get(tenant_conn).unwrap();

        assert_eq!(registry.evict_tenant("t1"), 1);
        assert!(handle.is_closed());
        assert!(registry.get(tenant_conn).is_none());
        assert!(registry.get(other_conn).is_some());
    }

    #[tokio::test]
    async fn ip_lookups() {
        let registry = ConnectionRegistry::new();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let other: IpAddr = "10.0.0.8".parse().unwrap();
        let (conn, _rx) = connect(&registry, Some("t1"), Some(ip), 8);

        assert!(registry.has_authorized_client_for_ip(ip));
        assert!(!registry.has_authorized_client_for_ip(other));
        assert_eq!(registry.clients_by_ip(ip), HashSet::from([conn]));
    }

    #[tokio::test]
    async fn send_after_close_is_noop() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = connect(&registry, None, None, 8);
        let handle = registry.get(conn).unwrap();
        registry.remove_client(conn);

        handle.send_frame("late".to_string()).await;
        assert!(handle.is_closed());
        assert!(rx.try_recv().is_err());
    }
}
