//! System metrics: gateway counters sampled into a bounded in-memory ring
//! and persisted as JSON snapshots.
//!
//! The ring has a single writer (the collector loop); readers clone the
//! most recent snapshot. Snapshot files land at
//! `metrics/system-current.json` and `metrics/system-hourly/{hour}.json`.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use gatehouse_core::StateLayout;

/// Ring depth: 24 h of minute samples.
const RING_CAPACITY: usize = 1_440;

/// One sampled snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Gateway uptime in seconds.
    pub uptime_secs: u64,
    /// Connected WebSocket clients.
    pub connections: usize,
    /// Registered tenants.
    pub tenants: usize,
    /// Live PTY sessions.
    pub pty_sessions: usize,
    /// Running schedulers (global included).
    pub schedulers_running: usize,
    /// Requests dispatched since start.
    pub requests_dispatched: u64,
    /// Events dropped for slow consumers since start.
    pub events_dropped: u64,
}

/// Counter store and snapshot ring.
pub struct MetricsCollector {
    layout: StateLayout,
    started_at: Instant,
    requests_dispatched: AtomicU64,
    ring: RwLock<VecDeque<SystemSnapshot>>,
}

impl MetricsCollector {
    /// Create a collector persisting under `layout`.
    #[must_use]
    pub fn new(layout: StateLayout) -> Self {
        Self {
            layout,
            started_at: Instant::now(),
            requests_dispatched: AtomicU64::new(0),
            ring: RwLock::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    /// Count one dispatched request.
    pub fn record_request(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests dispatched since start.
    #[must_use]
    pub fn requests_dispatched(&self) -> u64 {
        self.requests_dispatched.load(Ordering::Relaxed)
    }

    /// Gateway uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Build a snapshot from current gauges.
    #[must_use]
    pub fn sample(
        &self,
        connections: usize,
        tenants: usize,
        pty_sessions: usize,
        schedulers_running: usize,
        events_dropped: u64,
    ) -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Utc::now(),
            uptime_secs: self.uptime_secs(),
            connections,
            tenants,
            pty_sessions,
            schedulers_running,
            requests_dispatched: self.requests_dispatched(),
            events_dropped,
        }
    }

    /// Store a snapshot: push into the ring and persist the current and
    /// hourly files. Persistence failures are logged, never fatal.
    pub fn store(&self, snapshot: SystemSnapshot) {
        if let Ok(mut ring) = self.ring.write() {
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(snapshot.clone());
        }

        let write = || -> std::io::Result<()> {
            let bytes = serde_json::to_vec_pretty(&snapshot)?;
            std::fs::create_dir_all(self.layout.metrics_hourly_dir())?;
            std::fs::write(self.layout.metrics_current_file(), &bytes)?;
            let hour = snapshot.timestamp.format("%Y-%m-%dT%H").to_string();
            std::fs::write(
                self.layout.metrics_hourly_dir().join(format!("{hour}.json")),
                &bytes,
            )?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(error = %e, "failed to persist metrics snapshot");
        }
    }

    /// The most recent snapshot, if any.
    #[must_use]
    pub fn current(&self) -> Option<SystemSnapshot> {
        self.ring.read().ok().and_then(|r| r.back().cloned())
    }

    /// Number of samples held.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.ring.read().map(|r| r.len()).unwrap_or(0)
    }
}
