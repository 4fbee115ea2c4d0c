//! Persisted state layout.
//!
//! Every path the gateway reads or writes under its state directory is
//! derived here, in one place:
//!
//! ```text
//! tenants.json                 # tenant registry; file mode 0600
//! cron/jobs.json               # global scheduler job store
//! cron/runs/{jobId}.jsonl      # global run logs
//! metrics/system-current.json
//! metrics/system-hourly/{hour}.json
//! tenants/{tenantId}/
//!   openclaw.json              # tenant config overlay
//!   workspace/
//!   agents/{agentId}/sessions/
//!   memory/{agentId}.sqlite
//!   plugins/
//!   sandboxes/
//!   credentials/
//!   cron/jobs.json
//!   cron/runs/{jobId}.jsonl
//!   usage/current.json
//!   usage/{YYYY-MM}.json
//!   usage/rate-limits.json
//! ```

use std::path::{Path, PathBuf};

/// Subdirectories created under each tenant's state directory.
pub const TENANT_SUBDIRS: &[&str] = &[
    "workspace",
    "agents",
    "memory",
    "plugins",
    "sandboxes",
    "credentials",
    "cron",
    "usage",
];

/// Resolver for every persisted path under the gateway state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Create a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `tenants.json` — the tenant registry document.
    #[must_use]
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("tenants.json")
    }

    /// Directory holding all tenant subtrees.
    #[must_use]
    pub fn tenants_dir(&self) -> PathBuf {
        self.root.join("tenants")
    }

    /// A tenant's state directory.
    #[must_use]
    pub fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenants_dir().join(tenant_id)
    }

    /// A tenant's config overlay document.
    #[must_use]
    pub fn tenant_config_file(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("openclaw.json")
    }

    /// A tenant's workspace directory (mounted at `/workspace` in sandboxes).
    #[must_use]
    pub fn workspace_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("workspace")
    }

    /// A tenant's agents directory.
    #[must_use]
    pub fn agents_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("agents")
    }

    /// Session transcripts for one agent of one tenant.
    #[must_use]
    pub fn agent_sessions_dir(&self, tenant_id: &str, agent_id: &str) -> PathBuf {
        self.agents_dir(tenant_id).join(agent_id).join("sessions")
    }

    /// A tenant's agent-memory directory.
    #[must_use]
    pub fn memory_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("memory")
    }

    /// Global scheduler job store.
    #[must_use]
    pub fn global_jobs_file(&self) -> PathBuf {
        self.root.join("cron").join("jobs.json")
    }

    /// Global run log for one job.
    #[must_use]
    pub fn global_run_log(&self, job_id: &str) -> PathBuf {
        self.root
            .join("cron")
            .join("runs")
            .join(format!("{job_id}.jsonl"))
    }

    /// A tenant's scheduler job store.
    #[must_use]
    pub fn tenant_jobs_file(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("cron").join("jobs.json")
    }

    /// A tenant's run log for one job.
    #[must_use]
    pub fn tenant_run_log(&self, tenant_id: &str, job_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id)
            .join("cron")
            .join("runs")
            .join(format!("{job_id}.jsonl"))
    }

    /// A tenant's usage directory.
    #[must_use]
    pub fn usage_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join("usage")
    }

    /// A tenant's current usage snapshot.
    #[must_use]
    pub fn usage_current_file(&self, tenant_id: &str) -> PathBuf {
        self.usage_dir(tenant_id).join("current.json")
    }

    /// An archived usage snapshot for a `YYYY-MM` period.
    #[must_use]
    pub fn usage_archive_file(&self, tenant_id: &str, period: &str) -> PathBuf {
        self.usage_dir(tenant_id).join(format!("{period}.json"))
    }

    /// A tenant's rate-limit window file.
    #[must_use]
    pub fn rate_limits_file(&self, tenant_id: &str) -> PathBuf {
        self.usage_dir(tenant_id).join("rate-limits.json")
    }

    /// Metrics directory.
    #[must_use]
    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("metrics")
    }

    /// Most-recent system metrics snapshot.
    #[must_use]
    pub fn metrics_current_file(&self) -> PathBuf {
        self.metrics_dir().join("system-current.json")
    }

    /// Hourly metrics snapshot directory.
    #[must_use]
    pub fn metrics_hourly_dir(&self) -> PathBuf {
        self.metrics_dir().join("system-hourly")
    }

    /// Create a tenant's state directory tree.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn ensure_tenant_tree(&self, tenant_id: &str) -> std::io::Result<()> {
        let dir = self.tenant_dir(tenant_id);
        for sub in TENANT_SUBDIRS {
            std::fs::create_dir_all(dir.join(sub))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_paths_are_namespaced() {
        let layout = StateLayout::new("/var/lib/gatehouse");
        assert!(
            layout
                .usage_current_file("demo")
                .ends_with("tenants/demo/usage/current.json")
        );
        assert!(
            layout
                .tenant_run_log("demo", "job-1")
                .ends_with("tenants/demo/cron/runs/job-1.jsonl")
        );
        assert!(
            layout
                .tenant_config_file("demo")
                .ends_with("tenants/demo/openclaw.json")
        );
    }

    #[test]
    fn ensure_tenant_tree_creates_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(tmp.path());
        layout.ensure_tenant_tree("demo").unwrap();
        for sub in TENANT_SUBDIRS {
            assert!(layout.tenant_dir("demo").join(sub).is_dir(), "{sub}");
        }
    }
}
