//! The tenant registry: a single versioned JSON document.
//!
//! All mutation is load-then-mutate-then-save while holding an exclusive
//! advisory lock on the document, so a CLI invocation and a running
//! gateway never interleave writes. Readers load and close without
//! locking. The file is written mode 0600 (owner read/write only).
//!
//! A missing or unreadable document bootstraps as an empty registry so
//! first-run installs need no setup step.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gatehouse_core::{StateLayout, is_valid_tenant_id};

use crate::error::{TenancyError, TenancyResult};
use crate::quota::Quotas;
use crate::token;

/// Current document format version.
const REGISTRY_VERSION: u32 = 1;

/// One persisted tenant entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    /// Hex-encoded SHA-256 of the tenant secret.
    pub token_hash: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful token validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Optional display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Disabled tenants fail token validation and are skipped by the
    /// scheduler supervisor.
    #[serde(default)]
    pub disabled: bool,
    /// Optional quota envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotas: Option<Quotas>,
}

/// The registry document as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryDoc {
    version: u32,
    tenants: BTreeMap<String, TenantRecord>,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            tenants: BTreeMap::new(),
        }
    }
}

/// Resolved tenant context returned by a successful token validation.
#[derive(Debug, Clone)]
pub struct TenantContext {
    /// The authenticated tenant id.
    pub tenant_id: String,
    /// The tenant's state directory.
    pub state_dir: PathBuf,
    /// Display name, if set.
    pub display_name: Option<String>,
    /// Quota envelope (empty = unlimited).
    pub quotas: Quotas,
}

/// Selective field update for [`TenantRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct TenantUpdate {
    /// Replace the display name.
    pub display_name: Option<String>,
    /// Set the disabled flag.
    pub disabled: Option<bool>,
    /// Replace the quota envelope.
    pub quotas: Option<Quotas>,
}

/// The tenant registry.
pub struct TenantRegistry {
    layout: StateLayout,
}

impl TenantRegistry {
    /// Create a registry over the given layout.
    #[must_use]
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    /// The layout this registry persists under.
    #[must_use]
    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Create a tenant. Returns the record and the plaintext token — the
    /// only time the token is ever available.
    ///
    /// # Errors
    ///
    /// [`TenancyError::InvalidTenantId`] on a malformed id,
    /// [`TenancyError::TenantExists`] on a duplicate, plus I/O failures.
    pub fn create(
        &self,
        tenant_id: &str,
        display_name: Option<String>,
    ) -> TenancyResult<(TenantRecord, String)> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(TenancyError::InvalidTenantId(tenant_id.to_string()));
        }
        let secret = token::generate_secret();
        let record = TenantRecord {
            token_hash: token::hash_secret(&secret),
            created_at: Utc::now(),
            last_seen_at: None,
            display_name,
            disabled: false,
            quotas: None,
        };

        let stored = record.clone();
        self.with_doc(|doc| {
            if doc.tenants.contains_key(tenant_id) {
                return Err(TenancyError::TenantExists(tenant_id.to_string()));
            }
            doc.tenants.insert(tenant_id.to_string(), stored);
            Ok(())
        })?;

        self.layout
            .ensure_tenant_tree(tenant_id)
            .map_err(|e| TenancyError::io(self.layout.tenant_dir(tenant_id), e))?;

        debug!(tenant = %tenant_id, "created tenant");
        Ok((record, token::format_token(tenant_id, &secret)))
    }

    /// Remove a tenant, optionally deleting its state subtree.
    ///
    /// # Errors
    ///
    /// [`TenancyError::TenantNotFound`] plus I/O failures.
    pub fn remove(&self, tenant_id: &str, delete_data: bool) -> TenancyResult<()> {
        self.with_doc(|doc| {
            if doc.tenants.remove(tenant_id).is_none() {
                return Err(TenancyError::TenantNotFound(tenant_id.to_string()));
            }
            Ok(())
        })?;

        if delete_data {
            let dir = self.layout.tenant_dir(tenant_id);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| TenancyError::io(dir, e))?;
            }
        }
        debug!(tenant = %tenant_id, delete_data, "removed tenant");
        Ok(())
    }

    /// Rotate the tenant secret. Returns the new plaintext token.
    ///
    /// # Errors
    ///
    /// [`TenancyError::TenantNotFound`] plus I/O failures.
    pub fn rotate(&self, tenant_id: &str) -> TenancyResult<String> {
        let secret = token::generate_secret();
        let hash = token::hash_secret(&secret);
        self.with_doc(|doc| {
            let record = doc
                .tenants
                .get_mut(tenant_id)
                .ok_or_else(|| TenancyError::TenantNotFound(tenant_id.to_string()))?;
            record.token_hash = hash.clone();
            Ok(())
        })?;
        Ok(token::format_token(tenant_id, &secret))
    }

    /// Selectively update tenant fields.
    ///
    /// # Errors
    ///
    /// [`TenancyError::TenantNotFound`] plus I/O failures.
    pub fn update(&self, tenant_id: &str, update: TenantUpdate) -> TenancyResult<TenantRecord> {
        let mut updated: Option<TenantRecord> = None;
        self.with_doc(|doc| {
            let record = doc
                .tenants
                .get_mut(tenant_id)
                .ok_or_else(|| TenancyError::TenantNotFound(tenant_id.to_string()))?;
            if let Some(name) = update.display_name.clone() {
                record.display_name = Some(name);
            }
            if let Some(disabled) = update.disabled {
                record.disabled = disabled;
            }
            if let Some(quotas) = update.quotas {
                record.quotas = Some(quotas);
            }
            updated = Some(record.clone());
            Ok(())
        })?;
        // with_doc only returns Ok after the closure stored the record.
        updated.ok_or_else(|| TenancyError::TenantNotFound(tenant_id.to_string()))
    }

    /// Look up one tenant.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn get(&self, tenant_id: &str) -> TenancyResult<Option<TenantRecord>> {
        Ok(self.load()?.tenants.get(tenant_id).cloned())
    }

    /// List all tenant ids.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn list(&self) -> TenancyResult<Vec<String>> {
        Ok(self.load()?.tenants.keys().cloned().collect())
    }

    /// Validate a presented token string.
    ///
    /// Fails (returns `None`) on a malformed token, an unknown or disabled
    /// tenant, or a secret hash mismatch. The hash comparison is constant
    /// time. On success `lastSeenAt` is updated best-effort.
    ///
    /// # Errors
    ///
    /// Propagates registry read failures; an authentication failure is
    /// `Ok(None)`, not an error.
    pub fn validate_token(&self, presented: &str) -> TenancyResult<Option<TenantContext>> {
        let Some(parsed) = token::parse_token(presented) else {
            return Ok(None);
        };
        let doc = self.load()?;
        let Some(record) = doc.tenants.get(parsed.tenant_id) else {
            return Ok(None);
        };
        if record.disabled {
            return Ok(None);
        }
        if !token::verify_secret(parsed.secret, &record.token_hash) {
            return Ok(None);
        }

        // Best-effort lastSeenAt update; a write failure must not fail auth.
        let seen = Utc::now();
        let touch = self.with_doc(|doc| {
            if let Some(record) = doc.tenants.get_mut(parsed.tenant_id) {
                record.last_seen_at = Some(seen);
            }
            Ok(())
        });
        if let Err(e) = touch {
            warn!(tenant = %parsed.tenant_id, error = %e, "failed to update lastSeenAt");
        }

        Ok(Some(TenantContext {
            tenant_id: parsed.tenant_id.to_string(),
            state_dir: self.layout.tenant_dir(parsed.tenant_id),
            display_name: record.display_name.clone(),
            quotas: record.quotas.unwrap_or_default(),
        }))
    }

    // ------------------------------------------------------------------
    // Document I/O
    // ------------------------------------------------------------------

    /// Read-only load. Missing or unparseable documents bootstrap empty.
    fn load(&self) -> TenancyResult<RegistryDoc> {
        let path = self.layout.registry_file();
        match fs::read(&path) {
            Ok(bytes) => Ok(parse_doc(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryDoc::default()),
            Err(e) => Err(TenancyError::io(path, e)),
        }
    }

    /// Load, mutate, and save under an exclusive advisory file lock.
    fn with_doc(
        &self,
        mutate: impl FnOnce(&mut RegistryDoc) -> TenancyResult<()>,
    ) -> TenancyResult<()> {
        let path = self.layout.registry_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TenancyError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| TenancyError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| TenancyError::io(&path, e))?;

        let result = (|| {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)
                .map_err(|e| TenancyError::io(&path, e))?;
            let mut doc = parse_doc(&bytes);
            mutate(&mut doc)?;

            let out = serde_json::to_vec_pretty(&doc)?;
            file.set_len(0).map_err(|e| TenancyError::io(&path, e))?;
            file.rewind().map_err(|e| TenancyError::io(&path, e))?;
            file.write_all(&out).map_err(|e| TenancyError::io(&path, e))?;
            file.flush().map_err(|e| TenancyError::io(&path, e))?;
            restrict_permissions(&file).map_err(|e| TenancyError::io(&path, e))?;
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&file);
        result
    }
}

/// Parse a registry document, treating malformed content as empty.
fn parse_doc(bytes: &[u8]) -> RegistryDoc {
    if bytes.is_empty() {
        return RegistryDoc::default();
    }
    match serde_json::from_slice::<RegistryDoc>(bytes) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "tenant registry unreadable, starting empty");
            RegistryDoc::default()
        },
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, TenantRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::new(StateLayout::new(tmp.path()));
        (tmp, registry)
    }

    #[test]
    fn create_and_validate_round_trip() {
        let (_tmp, registry) = registry();
        let (record, plaintext) = registry.create("demo", None).unwrap();
        assert!(!record.disabled);
        assert!(plaintext.starts_with("tenant:demo:"));

        // Token matches the documented pattern: secret at least 32 url-safe chars.
        let secret = plaintext.rsplit(':').next().unwrap();
        assert!(secret.len() >= 32);

        let ctx = registry.validate_token(&plaintext).unwrap().unwrap();
        assert_eq!(ctx.tenant_id, "demo");
        assert!(ctx.state_dir.ends_with("tenants/demo"));
        assert_eq!(registry.list().unwrap(), vec!["demo".to_string()]);
    }

    #[test]
    fn create_initializes_state_tree() {
        let (tmp, registry) = registry();
        registry.create("demo", None).unwrap();
        for sub in gatehouse_core::paths::TENANT_SUBDIRS {
            assert!(tmp.path().join("tenants/demo").join(sub).is_dir());
        }
    }

    #[test]
    fn duplicate_create_fails() {
        let (_tmp, registry) = registry();
        registry.create("demo", None).unwrap();
        assert!(matches!(
            registry.create("demo", None),
            Err(TenancyError::TenantExists(_))
        ));
    }

    #[test]
    fn invalid_id_rejected() {
        let (_tmp, registry) = registry();
        assert!(matches!(
            registry.create("Bad Tenant", None),
            Err(TenancyError::InvalidTenantId(_))
        ));
    }

    #[test]
    fn flipped_secret_byte_fails_validation() {
        let (_tmp, registry) = registry();
        let (_, plaintext) = registry.create("demo", None).unwrap();
        let mut bytes = plaintext.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'x' { b'y' } else { b'x' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(registry.validate_token(&tampered).unwrap().is_none());
    }

    #[test]
    fn disabled_tenant_fails_validation() {
        let (_tmp, registry) = registry();
        let (_, plaintext) = registry.create("demo", None).unwrap();
        registry
            .update(
                "demo",
                TenantUpdate {
                    disabled: Some(true),
                    ..TenantUpdate::default()
                },
            )
            .unwrap();
        assert!(registry.validate_token(&plaintext).unwrap().is_none());
    }

    #[test]
    fn rotate_invalidates_old_token() {
        let (_tmp, registry) = registry();
        let (_, old) = registry.create("demo", None).unwrap();
        let new = registry.rotate("demo").unwrap();
        assert_ne!(old, new);
        assert!(registry.validate_token(&old).unwrap().is_none());
        assert!(registry.validate_token(&new).unwrap().is_some());
    }

    #[test]
    fn validation_updates_last_seen() {
        let (_tmp, registry) = registry();
        let (_, plaintext) = registry.create("demo", None).unwrap();
        assert!(registry.get("demo").unwrap().unwrap().last_seen_at.is_none());
        registry.validate_token(&plaintext).unwrap().unwrap();
        assert!(registry.get("demo").unwrap().unwrap().last_seen_at.is_some());
    }

    #[test]
    fn remove_with_delete_data_clears_subtree() {
        let (tmp, registry) = registry();
        registry.create("demo", None).unwrap();
        assert!(tmp.path().join("tenants/demo").is_dir());
        registry.remove("demo", true).unwrap();
        assert!(!tmp.path().join("tenants/demo").exists());
        assert!(registry.get("demo").unwrap().is_none());
    }

    #[test]
    fn missing_registry_file_is_empty() {
        let (_tmp, registry) = registry();
        assert!(registry.list().unwrap().is_empty());
        assert!(registry.get("ghost").unwrap().is_none());
    }

    #[test]
    fn corrupt_registry_bootstraps_empty() {
        let (tmp, registry) = registry();
        fs::write(tmp.path().join("tenants.json"), b"{not json").unwrap();
        assert!(registry.list().unwrap().is_empty());
        // And a create works on top of it.
        registry.create("demo", None).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn registry_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (tmp, registry) = registry();
        registry.create("demo", None).unwrap();
        let mode = fs::metadata(tmp.path().join("tenants.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
