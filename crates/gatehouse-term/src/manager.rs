//! The PTY session registry.
//!
//! Process-wide map from terminal id to session. Every session is owned by
//! exactly one tenant and one originating connection; output fans out to
//! that connection only. A lazily started reaper kills sessions idle for
//! more than five minutes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gatehouse_core::{ConnId, EventSink, GatewayError};

use crate::spawner::{PtyControl, PtySpawner, SpawnSpec};

/// How often the reaper scans for idle sessions.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle cutoff before a session is reaped.
pub const IDLE_CUTOFF: Duration = Duration::from_secs(5 * 60);

/// Geometry bounds.
const COLS_RANGE: (u16, u16) = (10, 500);
const ROWS_RANGE: (u16, u16) = (5, 200);

/// Default shell when the caller specifies none.
const DEFAULT_SHELL: &str = "/bin/bash";

/// Identity of the caller of a terminal verb.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    /// The calling connection.
    pub conn_id: ConnId,
    /// Tenant context, if the connection authenticated with a tenant token.
    pub tenant_id: Option<&'a str>,
    /// Whether the connection holds admin scope.
    pub admin: bool,
}

/// Spawn parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnOptions {
    /// Requested width; clamped to `[10, 500]`.
    pub cols: Option<u16>,
    /// Requested height; clamped to `[5, 200]`.
    pub rows: Option<u16>,
    /// Shell binary; defaults to `/bin/bash`.
    pub shell: Option<String>,
    /// Extra environment variables.
    pub env: Option<HashMap<String, String>>,
}

/// Wire description of a session, as returned by `terminal.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtySessionInfo {
    /// Session id.
    pub terminal_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// OS process id.
    pub pid: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write or output activity.
    pub last_activity_at: DateTime<Utc>,
}

struct PtySession {
    tenant_id: String,
    conn_id: ConnId,
    pid: u32,
    control: Arc<dyn PtyControl>,
    created_at: DateTime<Utc>,
    /// Epoch milliseconds, updated on every write and output event.
    last_activity_ms: Arc<AtomicI64>,
}

impl PtySession {
    fn info(&self, terminal_id: Uuid) -> PtySessionInfo {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        PtySessionInfo {
            terminal_id,
            tenant_id: self.tenant_id.clone(),
            pid: self.pid,
            created_at: self.created_at,
            last_activity_at: Utc
                .timestamp_millis_opt(ms)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Registry of live PTY sessions.
pub struct TerminalManager {
    spawner: Arc<dyn PtySpawner>,
    sink: Arc<dyn EventSink>,
    sessions: DashMap<Uuid, PtySession>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    reap_interval: Duration,
    idle_cutoff: Duration,
}

impl TerminalManager {
    /// Create a manager with the standard reaper timing.
    #[must_use]
    pub fn new(spawner: Arc<dyn PtySpawner>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Self::with_timing(spawner, sink, REAP_INTERVAL, IDLE_CUTOFF)
    }

    /// Create a manager with custom reaper timing (tests).
    #[must_use]
    pub fn with_timing(
        spawner: Arc<dyn PtySpawner>,
        sink: Arc<dyn EventSink>,
        reap_interval: Duration,
        idle_cutoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            sink,
            sessions: DashMap::new(),
            reaper: Mutex::new(None),
            reap_interval,
            idle_cutoff,
        })
    }

    /// Spawn a PTY for the calling tenant.
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` without tenant context; `UNAVAILABLE` on spawn
    /// failure.
    pub fn spawn(
        self: &Arc<Self>,
        caller: Caller<'_>,
        opts: SpawnOptions,
    ) -> Result<PtySessionInfo, GatewayError> {
        let Some(tenant_id) = caller.tenant_id else {
            return Err(GatewayError::unauthorized(
                "terminal.spawn requires a tenant context",
            ));
        };

        let cols = clamp(opts.cols.unwrap_or(80), COLS_RANGE);
        let rows = clamp(opts.rows.unwrap_or(24), ROWS_RANGE);
        let shell = opts.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let spawned = self
            .spawner
            .spawn(SpawnSpec {
                tenant_id: tenant_id.to_string(),
                shell,
                cols,
                rows,
                env: opts.env.unwrap_or_default(),
                cwd: None,
            })
            .map_err(|e| GatewayError::unavailable(e.to_string()))?;

        let terminal_id = Uuid::new_v4();
        let last_activity_ms = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        let session = PtySession {
            tenant_id: tenant_id.to_string(),
            conn_id: caller.conn_id,
            pid: spawned.pid,
            control: Arc::clone(&spawned.control),
            created_at: Utc::now(),
            last_activity_ms: Arc::clone(&last_activity_ms),
        };
        let info = session.info(terminal_id);
        self.sessions.insert(terminal_id, session);

        self.start_output_pump(terminal_id, caller.conn_id, spawned.output, last_activity_ms);
        self.start_exit_watcher(terminal_id, spawned.exit);
        self.ensure_reaper();

        info!(terminal = %terminal_id, tenant = %tenant_id, pid = info.pid, "spawned pty");
        Ok(info)
    }

    /// Forward bytes into a session.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for an unknown id, `UNAUTHORIZED` for cross-tenant
    /// access, `UNAVAILABLE` when the PTY writer fails.
    pub fn write(
        &self,
        caller: Caller<'_>,
        terminal_id: Uuid,
        data: &str,
    ) -> Result<(), GatewayError> {
        let session = self.access(caller, terminal_id)?;
        session
            .control
            .write(data.as_bytes())
            .map_err(|e| GatewayError::unavailable(format!("pty write failed: {e}")))?;
        session
            .last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Resize a session, clamping geometry to the allowed bounds.
    ///
    /// # Errors
    ///
    /// Same error set as [`Self::write`].
    pub fn resize(
        &self,
        caller: Caller<'_>,
        terminal_id: Uuid,
        cols: u16,
        rows: u16,
    ) -> Result<(), GatewayError> {
        let session = self.access(caller, terminal_id)?;
        session
            .control
            .resize(clamp(cols, COLS_RANGE), clamp(rows, ROWS_RANGE))
            .map_err(|e| GatewayError::unavailable(format!("pty resize failed: {e}")))
    }

    /// Kill and remove a session. The record is deleted even when the kill
    /// itself fails.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` or `UNAUTHORIZED`.
    pub fn close(&self, caller: Caller<'_>, terminal_id: Uuid) -> Result<(), GatewayError> {
        // Access check against the live record before removal.
        self.access(caller, terminal_id)?;
        if let Some((_, session)) = self.sessions.remove(&terminal_id) {
            session.control.kill();
            self.emit_exit(terminal_id, session.conn_id, None);
            info!(terminal = %terminal_id, tenant = %session.tenant_id, "closed pty");
        }
        Ok(())
    }

    /// List sessions visible to the caller: everything for a non-tenant
    /// admin, own sessions for a tenant, nothing otherwise.
    #[must_use]
    pub fn list(&self, caller: Caller<'_>) -> Vec<PtySessionInfo> {
        self.sessions
            .iter()
            .filter(|entry| match caller.tenant_id {
                Some(tenant) => entry.value().tenant_id == tenant,
                None => caller.admin,
            })
            .map(|entry| entry.value().info(*entry.key()))
            .collect()
    }

    /// Terminate every PTY owned by a tenant. Invoked on tenant disable
    /// and delete. Returns the number of sessions closed.
    pub fn close_all_tenant_terminals(&self, tenant_id: &str) -> usize {
        let ids: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().tenant_id == tenant_id)
            .map(|entry| *entry.key())
            .collect();
        let mut closed = 0usize;
        for id in &ids {
            if let Some((_, session)) = self.sessions.remove(id) {
                session.control.kill();
                self.emit_exit(*id, session.conn_id, None);
                closed = closed.saturating_add(1);
            }
        }
        if closed > 0 {
            info!(tenant = %tenant_id, closed, "closed all tenant ptys");
        }
        closed
    }

    /// Kill every live session. Used during gateway shutdown. Returns the
    /// number of sessions closed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0usize;
        for id in &ids {
            if let Some((_, session)) = self.sessions.remove(id) {
                session.control.kill();
                self.emit_exit(*id, session.conn_id, None);
                closed = closed.saturating_add(1);
            }
        }
        closed
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ------------------------------------------------------------------
    // Access control
    // ------------------------------------------------------------------

    /// Owner-or-admin check. Cross-tenant access is denied outright: a
    /// tenant-authenticated connection can never touch another tenant's
    /// PTY, admin scope or not. Only a connection *without* tenant context
    /// and *with* admin scope crosses tenants.
    fn access(
        &self,
        caller: Caller<'_>,
        terminal_id: Uuid,
    ) -> Result<SessionHandle, GatewayError> {
        let session = self
            .sessions
            .get(&terminal_id)
            .ok_or_else(|| GatewayError::not_found(format!("unknown terminal {terminal_id}")))?;
        let allowed = match caller.tenant_id {
            Some(tenant) => session.tenant_id == tenant,
            None => caller.admin,
        };
        if !allowed {
            return Err(GatewayError::unauthorized(
                "terminal is owned by another tenant",
            ));
        }
        Ok(SessionHandle {
            control: Arc::clone(&session.control),
            last_activity_ms: Arc::clone(&session.last_activity_ms),
        })
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    fn start_output_pump(
        self: &Arc<Self>,
        terminal_id: Uuid,
        conn_id: ConnId,
        mut output: tokio::sync::mpsc::Receiver<Vec<u8>>,
        last_activity_ms: Arc<AtomicI64>,
    ) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(bytes) = output.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                manager.sink.send_to(
                    &[conn_id],
                    "terminal.output",
                    json!({
                        "terminalId": terminal_id,
                        "data": String::from_utf8_lossy(&bytes),
                    }),
                    true,
                );
            }
        });
    }

    fn start_exit_watcher(self: &Arc<Self>, terminal_id: Uuid, exit: tokio::sync::oneshot::Receiver<i32>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = exit.await.ok();
            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Whoever removes the record emits the exit event; a close or
            // reap that got there first already did.
            if let Some((_, session)) = manager.sessions.remove(&terminal_id) {
                manager.emit_exit(terminal_id, session.conn_id, code);
                debug!(terminal = %terminal_id, ?code, "pty exited");
            }
        });
    }

    fn emit_exit(&self, terminal_id: Uuid, conn_id: ConnId, code: Option<i32>) {
        self.sink.send_to(
            &[conn_id],
            "terminal.exit",
            json!({ "terminalId": terminal_id, "exitCode": code }),
            true,
        );
    }

    /// Start the idle reaper if it is not already running. Runs until
    /// process exit (or until the manager is dropped).
    fn ensure_reaper(self: &Arc<Self>) {
        let mut guard = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let manager = Arc::downgrade(self);
        let interval = self.reap_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.reap_idle();
            }
        }));
    }

    fn reap_idle(&self) {
        let cutoff_ms = i64::try_from(self.idle_cutoff.as_millis()).unwrap_or(i64::MAX);
        let now_ms = Utc::now().timestamp_millis();
        let idle: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| {
                let last = entry.value().last_activity_ms.load(Ordering::Relaxed);
                now_ms.saturating_sub(last) > cutoff_ms
            })
            .map(|entry| *entry.key())
            .collect();
        for id in idle {
            if let Some((_, session)) = self.sessions.remove(&id) {
                warn!(terminal = %id, tenant = %session.tenant_id, "reaping idle pty");
                session.control.kill();
                self.emit_exit(id, session.conn_id, None);
            }
        }
    }
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

struct SessionHandle {
    control: Arc<dyn PtyControl>,
    last_activity_ms: Arc<AtomicI64>,
}

fn clamp(value: u16, (lo, hi): (u16, u16)) -> u16 {
    value.clamp(lo, hi)
}
