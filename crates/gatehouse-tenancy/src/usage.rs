//! Per-tenant, per-period usage snapshots.
//!
//! Periods are `YYYY-MM` in UTC. When the clock crosses a month boundary
//! the stored snapshot is archived under its period label and a fresh
//! zeroed snapshot takes its place. Counter updates are monotonic and
//! saturating; `active_sessions` clamps at zero on decrement.

use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gatehouse_core::StateLayout;

use crate::error::{TenancyError, TenancyResult};

/// Disk usage, decomposed by subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskUsageBytes {
    /// Whole tenant state directory.
    pub total: u64,
    /// `workspace/` subtree.
    pub workspace: u64,
    /// `agents/` subtree.
    pub agent_data: u64,
    /// `memory/` subtree.
    pub memory: u64,
}

/// One tenant's usage counters for one period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageSnapshot {
    /// `YYYY-MM` period label.
    pub period: String,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Cache-read tokens.
    pub cache_read_tokens: u64,
    /// Cache-write tokens.
    pub cache_write_tokens: u64,
    /// Invariant: sum of the four token counters above.
    pub total_tokens: u64,
    /// Accumulated cost in cents.
    pub cost_cents: u64,
    /// Last recorded disk usage.
    pub disk: DiskUsageBytes,
    /// Sessions started this period.
    pub sessions_started: u64,
    /// Currently active sessions.
    pub active_sessions: u64,
    /// Messages processed this period.
    pub message_count: u64,
    /// Requests this period.
    pub requests_total: u64,
    /// Requests in the trailing minute window, as of the last rate check.
    pub requests_this_minute: u64,
    /// Requests in the trailing hour window, as of the last rate check.
    pub requests_this_hour: u64,
    /// Sandbox CPU seconds consumed.
    pub sandbox_cpu_seconds: u64,
    /// Peak sandbox memory observed, in bytes.
    pub sandbox_peak_memory_bytes: u64,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Default for UsageSnapshot {
    fn default() -> Self {
        Self::empty(String::new())
    }
}

impl UsageSnapshot {
    /// A zeroed snapshot for the given period.
    #[must_use]
    pub fn empty(period: String) -> Self {
        Self {
            period,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            total_tokens: 0,
            cost_cents: 0,
            disk: DiskUsageBytes::default(),
            sessions_started: 0,
            active_sessions: 0,
            message_count: 0,
            requests_total: 0,
            requests_this_minute: 0,
            requests_this_hour: 0,
            sandbox_cpu_seconds: 0,
            sandbox_peak_memory_bytes: 0,
            updated_at: Utc::now(),
        }
    }

    fn recompute_total(&mut self) {
        self.total_tokens = self
            .input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_write_tokens);
    }
}

/// Token/cost increments from one completed run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenDelta {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Cache-read tokens.
    pub cache_read_tokens: u64,
    /// Cache-write tokens.
    pub cache_write_tokens: u64,
    /// Cost in cents.
    pub cost_cents: u64,
    /// Messages exchanged.
    pub messages: u64,
}

/// The `YYYY-MM` period label for a point in time.
#[must_use]
pub fn period_label(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Per-tenant usage ledger.
///
/// Writes are sharded: each tenant has its own mutex, allocated on first
/// touch. Readers of other tenants never contend.
pub struct UsageLedger {
    layout: StateLayout,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UsageLedger {
    /// Create a ledger over the given layout.
    #[must_use]
    pub fn new(layout: StateLayout) -> Self {
        Self {
            layout,
            locks: DashMap::new(),
        }
    }

    /// The layout this ledger writes under.
    #[must_use]
    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub(crate) fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load the current snapshot, archiving and resetting on a period
    /// rollover.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn load_usage(&self, tenant_id: &str) -> TenancyResult<UsageSnapshot> {
        self.load_usage_at(tenant_id, Utc::now())
    }

    /// [`Self::load_usage`] with an explicit clock, for rollover tests.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn load_usage_at(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> TenancyResult<UsageSnapshot> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = hold(&lock);
        self.load_locked(tenant_id, now)
    }

    /// Apply a token/cost delta.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn update_token_usage(&self, tenant_id: &str, delta: TokenDelta) -> TenancyResult<()> {
        self.mutate(tenant_id, |snapshot| {
            snapshot.input_tokens = snapshot.input_tokens.saturating_add(delta.input_tokens);
            snapshot.output_tokens = snapshot.output_tokens.saturating_add(delta.output_tokens);
            snapshot.cache_read_tokens = snapshot
                .cache_read_tokens
                .saturating_add(delta.cache_read_tokens);
            snapshot.cache_write_tokens = snapshot
                .cache_write_tokens
                .saturating_add(delta.cache_write_tokens);
            snapshot.cost_cents = snapshot.cost_cents.saturating_add(delta.cost_cents);
            snapshot.message_count = snapshot.message_count.saturating_add(delta.messages);
            snapshot.recompute_total();
        })
    }

    /// Record a session start or end. Ends clamp `active_sessions` at zero.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn update_session_count(&self, tenant_id: &str, started: bool) -> TenancyResult<()> {
        self.mutate(tenant_id, |snapshot| {
            if started {
                snapshot.sessions_started = snapshot.sessions_started.saturating_add(1);
                snapshot.active_sessions = snapshot.active_sessions.saturating_add(1);
            } else {
                snapshot.active_sessions = snapshot.active_sessions.saturating_sub(1);
            }
        })
    }

    /// Record sandbox resource consumption.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn update_sandbox_usage(
        &self,
        tenant_id: &str,
        cpu_seconds: u64,
        peak_memory_bytes: u64,
    ) -> TenancyResult<()> {
        self.mutate(tenant_id, |snapshot| {
            snapshot.sandbox_cpu_seconds = snapshot.sandbox_cpu_seconds.saturating_add(cpu_seconds);
            snapshot.sandbox_peak_memory_bytes =
                snapshot.sandbox_peak_memory_bytes.max(peak_memory_bytes);
        })
    }

    /// Store a freshly measured disk breakdown.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn record_disk_usage(&self, tenant_id: &str, disk: DiskUsageBytes) -> TenancyResult<()> {
        self.mutate(tenant_id, |snapshot| snapshot.disk = disk)
    }

    /// Store window counts after a successful rate check.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn record_request_counts(
        &self,
        tenant_id: &str,
        minute_count: u64,
        hour_count: u64,
    ) -> TenancyResult<()> {
        self.mutate(tenant_id, |snapshot| {
            snapshot.requests_total = snapshot.requests_total.saturating_add(1);
            snapshot.requests_this_minute = minute_count;
            snapshot.requests_this_hour = hour_count;
        })
    }

    fn mutate(
        &self,
        tenant_id: &str,
        apply: impl FnOnce(&mut UsageSnapshot),
    ) -> TenancyResult<()> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = hold(&lock);
        let mut snapshot = self.load_locked(tenant_id, Utc::now())?;
        apply(&mut snapshot);
        snapshot.updated_at = Utc::now();
        self.save_locked(tenant_id, &snapshot)
    }

    /// Load with the tenant lock already held.
    fn load_locked(&self, tenant_id: &str, now: DateTime<Utc>) -> TenancyResult<UsageSnapshot> {
        let path = self.layout.usage_current_file(tenant_id);
        let current_period = period_label(now);

        let stored: Option<UsageSnapshot> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(TenancyError::io(path, e)),
        };

        match stored {
            Some(snapshot) if snapshot.period == current_period => Ok(snapshot),
            Some(old) => {
                // Month rollover: archive the old snapshot under its label,
                // start fresh.
                if !old.period.is_empty() {
                    let archive = self.layout.usage_archive_file(tenant_id, &old.period);
                    self.write_json(&archive, &old)?;
                    debug!(tenant = %tenant_id, period = %old.period, "archived usage snapshot");
                }
                let fresh = UsageSnapshot::empty(current_period);
                self.save_locked(tenant_id, &fresh)?;
                Ok(fresh)
            },
            None => Ok(UsageSnapshot::empty(current_period)),
        }
    }

    fn save_locked(&self, tenant_id: &str, snapshot: &UsageSnapshot) -> TenancyResult<()> {
        let path = self.layout.usage_current_file(tenant_id);
        self.write_json(&path, snapshot)
    }

    fn write_json<T: Serialize>(&self, path: &std::path::Path, value: &T) -> TenancyResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TenancyError::io(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        fs::write(path, bytes).map_err(|e| TenancyError::io(path, e))
    }
}

/// Lock a tenant mutex, recovering from poisoning (a panic while holding
/// the guard leaves the file in a consistent last-written state).
pub(crate) fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
