//! Per-tenant archive ↔ object-store orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use gatehouse_core::StateLayout;
use gatehouse_tenancy::{TenancyError, TenantRegistry};

use crate::archive::{ArchiveError, ExtractReport, extract_filtered, pack_dir};
use crate::store::{ObjectMeta, ObjectStore, ObjectStoreError};

/// Backup/restore errors.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Tenant is not registered.
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// Tenant has no state directory to archive.
    #[error("tenant state directory missing: {0}")]
    StateDirMissing(String),

    /// Archive packing or extraction failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Object-store transport failed.
    #[error(transparent)]
    Store(#[from] ObjectStoreError),

    /// Registry access failed.
    #[error(transparent)]
    Tenancy(#[from] TenancyError),

    /// Filesystem failure outside the archive layer.
    #[error("backup i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// One archived snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Object key.
    pub key: String,
    /// Archive size in bytes.
    pub size: u64,
    /// Upload time.
    pub last_modified: chrono::DateTime<Utc>,
}

impl From<ObjectMeta> for BackupInfo {
    fn from(meta: ObjectMeta) -> Self {
        Self {
            key: meta.key,
            size: meta.size,
            last_modified: meta.last_modified,
        }
    }
}

/// Orchestrates tenant-state archives against the object store.
pub struct BackupOrchestrator {
    layout: StateLayout,
    store: Arc<dyn ObjectStore>,
    registry: Arc<TenantRegistry>,
    prefix: String,
}

impl BackupOrchestrator {
    /// Create an orchestrator uploading under `prefix`.
    #[must_use]
    pub fn new(
        layout: StateLayout,
        store: Arc<dyn ObjectStore>,
        registry: Arc<TenantRegistry>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            layout,
            store,
            registry,
            prefix: prefix.into(),
        }
    }

    /// Key prefix for one tenant's archives.
    fn tenant_prefix(&self, tenant_id: &str) -> String {
        format!("{}/{tenant_id}/", self.prefix)
    }

    /// Archive a tenant's state directory and upload it.
    ///
    /// The key defaults to
    /// `{prefix}/{tenantId}/{tenantId}-{timestamp}.tar.gz`.
    ///
    /// # Errors
    ///
    /// [`BackupError::TenantNotFound`], [`BackupError::StateDirMissing`],
    /// plus archive and store failures.
    pub async fn backup(
        &self,
        tenant_id: &str,
        key: Option<String>,
    ) -> Result<BackupInfo, BackupError> {
        if self.registry.get(tenant_id)?.is_none() {
            return Err(BackupError::TenantNotFound(tenant_id.to_string()));
        }
        let state_dir = self.layout.tenant_dir(tenant_id);
        if !state_dir.is_dir() {
            return Err(BackupError::StateDirMissing(tenant_id.to_string()));
        }

        let bytes = pack_dir(&state_dir)?;
        let size = bytes.len() as u64;
        let timestamp = Utc::now();
        let key = key.unwrap_or_else(|| {
            format!(
                "{}{tenant_id}-{}.tar.gz",
                self.tenant_prefix(tenant_id),
                timestamp.format("%Y-%m-%dT%H-%M-%S%.3fZ")
            )
        });

        let metadata = HashMap::from([
            ("tenantId".to_string(), tenant_id.to_string()),
            ("timestamp".to_string(), timestamp.to_rfc3339()),
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ]);
        self.store.put(&key, bytes, metadata).await?;
        info!(tenant = %tenant_id, key = %key, size, "uploaded tenant backup");

        Ok(BackupInfo {
            key,
            size,
            last_modified: timestamp,
        })
    }

    /// Download an archive and restore it into the tenant's state
    /// directory.
    ///
    /// The directory's previous contents are cleared first; extraction
    /// applies the path-traversal filter. With `create_if_missing` (admin
    /// only — callers enforce scope) an unregistered tenant is created
    /// before the restore; its token must then be rotated to become
    /// usable.
    ///
    /// # Errors
    ///
    /// [`BackupError::TenantNotFound`] when the tenant is unknown and
    /// `create_if_missing` is false, plus store and archive failures.
    pub async fn restore(
        &self,
        tenant_id: &str,
        key: &str,
        create_if_missing: bool,
    ) -> Result<ExtractReport, BackupError> {
        let bytes = self.store.get(key).await?;

        if self.registry.get(tenant_id)?.is_none() {
            if !create_if_missing {
                return Err(BackupError::TenantNotFound(tenant_id.to_string()));
            }
            self.registry.create(tenant_id, None)?;
        }

        let state_dir = self.layout.tenant_dir(tenant_id);
        if state_dir.exists() {
            std::fs::remove_dir_all(&state_dir)?;
        }
        std::fs::create_dir_all(&state_dir)?;

        let report = extract_filtered(&bytes, &state_dir)?;
        info!(
            tenant = %tenant_id,
            key = %key,
            extracted = report.extracted,
            skipped = report.skipped.len(),
            "restored tenant backup"
        );
        Ok(report)
    }

    /// List a tenant's archived snapshots, newest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_backups(&self, tenant_id: &str) -> Result<Vec<BackupInfo>, BackupError> {
        let mut entries: Vec<BackupInfo> = self
            .store
            .list(&self.tenant_prefix(tenant_id))
            .await?
            .into_iter()
            .map(BackupInfo::from)
            .collect();
        entries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(entries)
    }

    /// Delete one archived snapshot.
    ///
    /// # Errors
    ///
    /// Propagates store failures (including not-found).
    pub async fn delete_backup(&self, key: &str) -> Result<(), BackupError> {
        self.store.delete(key).await?;
        Ok(())
    }

    /// Delete all but the newest `keep` snapshots. Returns the number
    /// deleted.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn prune(&self, tenant_id: &str, keep: usize) -> Result<usize, BackupError> {
        let entries = self.list_backups(tenant_id).await?;
        let mut deleted = 0usize;
        for entry in entries.iter().skip(keep) {
            self.store.delete(&entry.key).await?;
            deleted = deleted.saturating_add(1);
        }
        if deleted > 0 {
            info!(tenant = %tenant_id, deleted, keep, "pruned tenant backups");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsObjectStore;
    use std::fs;

    fn setup() -> (tempfile::TempDir, Arc<TenantRegistry>, BackupOrchestrator) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(tmp.path().join("state"));
        let registry = Arc::new(TenantRegistry::new(layout.clone()));
        let store = Arc::new(FsObjectStore::new(tmp.path().join("objects")));
        let orchestrator =
            BackupOrchestrator::new(layout, store, Arc::clone(&registry), "backups");
        (tmp, registry, orchestrator)
    }

    #[tokio::test]
    async fn backup_restore_round_trip() {
        let (tmp, registry, orchestrator) = setup();
        registry.create("demo", None).unwrap();
        let workspace = tmp.path().join("state/tenants/demo/workspace");
        fs::write(workspace.join("notes.txt"), b"important").unwrap();
        fs::write(
            tmp.path().join("state/tenants/demo/openclaw.json"),
            b"{\"defaultAgent\":\"beta\"}",
        )
        .unwrap();

        let info = orchestrator.backup("demo", None).await.unwrap();
        assert!(info.key.starts_with("backups/demo/demo-"));
        assert!(info.key.ends_with(".tar.gz"));

        // Wreck the live state, then restore.
        fs::write(workspace.join("notes.txt"), b"corrupted").unwrap();
        fs::write(workspace.join("junk.bin"), b"junk").unwrap();
        let report = orchestrator.restore("demo", &info.key, false).await.unwrap();
        assert!(report.skipped.is_empty());

        assert_eq!(fs::read(workspace.join("notes.txt")).unwrap(), b"important");
        assert!(!workspace.join("junk.bin").exists(), "restore clears first");

        // A second backup of the restored tree restores byte-identically.
        let info2 = orchestrator.backup("demo", None).await.unwrap();
        let report2 = orchestrator
            .restore("demo", &info2.key, false)
            .await
            .unwrap();
        assert!(report2.skipped.is_empty());
        assert_eq!(fs::read(workspace.join("notes.txt")).unwrap(), b"important");
    }

    #[tokio::test]
    async fn backup_unknown_tenant_fails() {
        let (_tmp, _registry, orchestrator) = setup();
        assert!(matches!(
            orchestrator.backup("ghost", None).await,
            Err(BackupError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_can_create_missing_tenant_for_admin() {
        let (tmp, registry, orchestrator) = setup();
        registry.create("demo", None).unwrap();
        fs::write(
            tmp.path().join("state/tenants/demo/workspace/a.txt"),
            b"data",
        )
        .unwrap();
        let info = orchestrator.backup("demo", None).await.unwrap();

        // Non-admin path refuses to conjure tenants.
        assert!(matches!(
            orchestrator.restore("clone", &info.key, false).await,
            Err(BackupError::TenantNotFound(_))
        ));

        orchestrator.restore("clone", &info.key, true).await.unwrap();
        assert!(registry.get("clone").unwrap().is_some());
        assert_eq!(
            fs::read(tmp.path().join("state/tenants/clone/workspace/a.txt")).unwrap(),
            b"data"
        );
    }

    #[tokio::test]
    async fn list_is_newest_first_and_prune_keeps_n() {
        let (tmp, registry, orchestrator) = setup();
        registry.create("demo", None).unwrap();
        fs::write(tmp.path().join("state/tenants/demo/workspace/f"), b"x").unwrap();

        for i in 0..4 {
            orchestrator
                .backup("demo", Some(format!("backups/demo/demo-{i:02}.tar.gz")))
                .await
                .unwrap();
        }

        let listed = orchestrator.list_backups("demo").await.unwrap();
        assert_eq!(listed.len(), 4);
        for pair in listed.windows(2) {
            assert!(pair[0].last_modified >= pair[1].last_modified);
        }

        let deleted = orchestrator.prune("demo", 2).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(orchestrator.list_backups("demo").await.unwrap().len(), 2);
    }
}
