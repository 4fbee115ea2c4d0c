//! The scheduler supervisor: one global scheduler plus a map of per-tenant
//! schedulers, started and stopped on demand.
//!
//! Lifecycle policy: a tenant scheduler is ensured on the first job add and
//! never stopped while the gateway runs; `remove` exists for tenant disable
//! and delete. This avoids the start/stop races of a "run only while jobs
//! exist" policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use gatehouse_core::{AgentRunner, EventSink, StateLayout};
use gatehouse_tenancy::TenantRegistry;

use crate::scheduler::{Scheduler, SchedulerScope, TICK_INTERVAL};
use crate::store::JobStore;

/// Owner of every scheduler instance in the process.
pub struct SchedulerSupervisor {
    layout: StateLayout,
    runner: Arc<dyn AgentRunner>,
    sink: Arc<dyn EventSink>,
    registry: Arc<TenantRegistry>,
    /// Whether scheduling is enabled globally; when false, ensured
    /// schedulers are created in the stopped state.
    enabled: bool,
    tick_interval: Duration,
    global: Scheduler,
    tenants: Mutex<HashMap<String, Scheduler>>,
}

impl SchedulerSupervisor {
    /// Create a supervisor. Nothing is started yet.
    #[must_use]
    pub fn new(
        layout: StateLayout,
        runner: Arc<dyn AgentRunner>,
        sink: Arc<dyn EventSink>,
        registry: Arc<TenantRegistry>,
        enabled: bool,
    ) -> Self {
        Self::with_tick_interval(layout, runner, sink, registry, enabled, TICK_INTERVAL)
    }

    /// Create a supervisor with a custom tick interval (tests).
    #[must_use]
    pub fn with_tick_interval(
        layout: StateLayout,
        runner: Arc<dyn AgentRunner>,
        sink: Arc<dyn EventSink>,
        registry: Arc<TenantRegistry>,
        enabled: bool,
        tick_interval: Duration,
    ) -> Self {
        let global = Scheduler::with_tick_interval(
            SchedulerScope::Global,
            Arc::new(JobStore::new(layout.global_jobs_file())),
            Arc::clone(&runner),
            Arc::clone(&sink),
            layout.clone(),
            tick_interval,
        );
        Self {
            layout,
            runner,
            sink,
            registry,
            enabled,
            tick_interval,
            global,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// The global scheduler.
    #[must_use]
    pub fn global(&self) -> Scheduler {
        self.global.clone()
    }

    /// The scheduler for a tenant, if one has been constructed.
    #[must_use]
    pub fn tenant(&self, tenant_id: &str) -> Option<Scheduler> {
        self.tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant_id)
            .cloned()
    }

    /// Get or construct the scheduler for a tenant. When scheduling is
    /// enabled globally the scheduler starts immediately; otherwise it is
    /// created stopped.
    pub fn ensure_tenant(&self, tenant_id: &str) -> Scheduler {
        let mut tenants = self
            .tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tenants.get(tenant_id) {
            return existing.clone();
        }
        let scheduler = Scheduler::with_tick_interval(
            SchedulerScope::Tenant(tenant_id.to_string()),
            Arc::new(JobStore::new(self.layout.tenant_jobs_file(tenant_id))),
            Arc::clone(&self.runner),
            Arc::clone(&self.sink),
            self.layout.clone(),
            self.tick_interval,
        );
        if self.enabled {
            scheduler.start();
        }
        tenants.insert(tenant_id.to_string(), scheduler.clone());
        info!(tenant = %tenant_id, started = self.enabled, "constructed tenant scheduler");
        scheduler
    }

    /// Stop and drop a tenant's scheduler. Used when the tenant is
    /// disabled or deleted.
    pub fn remove(&self, tenant_id: &str) {
        let removed = self
            .tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant_id);
        if let Some(scheduler) = removed {
            scheduler.stop();
            info!(tenant = %tenant_id, "removed tenant scheduler");
        }
    }

    /// Start the global scheduler, then one scheduler per non-disabled
    /// tenant whose job store is non-empty.
    pub fn start_all(&self) {
        self.global.start();
        let tenant_ids = match self.registry.list() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "cannot list tenants; only global scheduler started");
                return;
            },
        };
        for tenant_id in tenant_ids {
            let disabled = matches!(
                self.registry.get(&tenant_id),
                Ok(Some(record)) if record.disabled
            );
            if disabled {
                continue;
            }
            let store = JobStore::new(self.layout.tenant_jobs_file(&tenant_id));
            match store.is_empty() {
                Ok(true) => {},
                Ok(false) => {
                    self.ensure_tenant(&tenant_id).start();
                },
                Err(e) => {
                    warn!(tenant = %tenant_id, error = %e, "cannot read job store; skipping");
                },
            }
        }
    }

    /// Stop every scheduler.
    pub fn stop_all(&self) {
        self.global.stop();
        for scheduler in self
            .tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            scheduler.stop();
        }
    }

    /// Number of running schedulers (global included).
    #[must_use]
    pub fn running_count(&self) -> usize {
        let tenants = self
            .tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tenant_running = tenants.values().filter(|s| s.is_running()).count();
        tenant_running.saturating_add(usize::from(self.global.is_running()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ScheduledJob;
    use async_trait::async_trait;
    use gatehouse_core::{NullSink, RunInput, RunOutput, RunnerError};
    use serde_json::json;

    struct NoopRunner;

    #[async_trait]
    impl AgentRunner for NoopRunner {
        async fn run(&self, _: &str, _: RunInput) -> Result<RunOutput, RunnerError> {
            Ok(RunOutput {
                text: String::new(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn supervisor(enabled: bool) -> (tempfile::TempDir, Arc<TenantRegistry>, SchedulerSupervisor) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(tmp.path());
        let registry = Arc::new(TenantRegistry::new(layout.clone()));
        let supervisor = SchedulerSupervisor::new(
            layout,
            Arc::new(NoopRunner),
            Arc::new(NullSink),
            Arc::clone(&registry),
            enabled,
        );
        (tmp, registry, supervisor)
    }

    #[tokio::test]
    async fn ensure_tenant_constructs_once() {
        let (_tmp, _registry, supervisor) = supervisor(false);
        assert!(supervisor.tenant("tenant-a").is_none());
        let first = supervisor.ensure_tenant("tenant-a");
        let second = supervisor.ensure_tenant("tenant-a");
        assert_eq!(first.scope(), second.scope());
        assert!(supervisor.tenant("tenant-a").is_some());
        // Scheduling disabled globally: created stopped.
        assert!(!first.is_running());
    }

    #[tokio::test]
    async fn ensure_tenant_starts_when_enabled() {
        let (_tmp, _registry, supervisor) = supervisor(true);
        let scheduler = supervisor.ensure_tenant("tenant-a");
        assert!(scheduler.is_running());
        supervisor.remove("tenant-a");
        assert!(supervisor.tenant("tenant-a").is_none());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn start_all_skips_disabled_and_empty_tenants() {
        let (_tmp, registry, supervisor) = supervisor(true);
        registry.create("with-jobs", None).unwrap();
        registry.create("no-jobs", None).unwrap();
        registry.create("disabled", None).unwrap();
        registry
            .update(
                "disabled",
                gatehouse_tenancy::TenantUpdate {
                    disabled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        for tenant in ["with-jobs", "disabled"] {
            let store = JobStore::new(
                supervisor.layout.tenant_jobs_file(tenant),
            );
            store
                .add(ScheduledJob::new("j", "0 * * * * *", json!({})))
                .unwrap();
        }

        supervisor.start_all();
        assert!(supervisor.global().is_running());
        assert!(supervisor.tenant("with-jobs").is_some());
        assert!(supervisor.tenant("no-jobs").is_none());
        assert!(supervisor.tenant("disabled").is_none());
        assert_eq!(supervisor.running_count(), 2);

        supervisor.stop_all();
        assert_eq!(supervisor.running_count(), 0);
    }
}
