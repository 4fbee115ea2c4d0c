//! Recursive disk accounting with a short TTL cache.
//!
//! A native directory walk instead of shelling out to `du`: no process
//! spawn on the admin path and consistent cross-platform semantics. The
//! walk is slow by design and is never run on a request hot path — only
//! when an admin or the tenant explicitly asks for a refresh, and at most
//! once per TTL.

use std::path::Path;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use walkdir::WalkDir;

use gatehouse_core::StateLayout;

use crate::usage::DiskUsageBytes;

/// How long a measurement stays fresh.
pub const DISK_CACHE_TTL: Duration = Duration::from_secs(30);

/// Cached per-tenant disk measurements.
pub struct DiskUsageCache {
    layout: StateLayout,
    ttl: Duration,
    entries: DashMap<String, (Instant, DiskUsageBytes)>,
}

impl DiskUsageCache {
    /// Create a cache with the standard 30 s TTL.
    #[must_use]
    pub fn new(layout: StateLayout) -> Self {
        Self::with_ttl(layout, DISK_CACHE_TTL)
    }

    /// Create a cache with a custom TTL (tests).
    #[must_use]
    pub fn with_ttl(layout: StateLayout, ttl: Duration) -> Self {
        Self {
            layout,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Return the tenant's disk breakdown, measuring if the cache entry is
    /// stale or `force` is set.
    pub fn get(&self, tenant_id: &str, force: bool) -> DiskUsageBytes {
        if !force
            && let Some(entry) = self.entries.get(tenant_id)
            && entry.0.elapsed() < self.ttl
        {
            return entry.1;
        }
        let measured = self.measure(tenant_id);
        self.entries
            .insert(tenant_id.to_string(), (Instant::now(), measured));
        measured
    }

    /// Walk the tenant subtrees and sum file sizes.
    fn measure(&self, tenant_id: &str) -> DiskUsageBytes {
        DiskUsageBytes {
            total: dir_size(&self.layout.tenant_dir(tenant_id)),
            workspace: dir_size(&self.layout.workspace_dir(tenant_id)),
            agent_data: dir_size(&self.layout.agents_dir(tenant_id)),
            memory: dir_size(&self.layout.memory_dir(tenant_id)),
        }
    }
}

/// Recursive size of a directory in bytes. Missing directories count zero;
/// unreadable entries are skipped.
fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .fold(0u64, |acc, meta| acc.saturating_add(meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn measures_subtree_breakdown() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(tmp.path());
        layout.ensure_tenant_tree("demo").unwrap();
        fs::write(layout.workspace_dir("demo").join("a.txt"), vec![0u8; 100]).unwrap();
        fs::write(layout.memory_dir("demo").join("m.sqlite"), vec![0u8; 50]).unwrap();

        let cache = DiskUsageCache::new(layout);
        let usage = cache.get("demo", true);
        assert_eq!(usage.workspace, 100);
        assert_eq!(usage.memory, 50);
        assert_eq!(usage.agent_data, 0);
        assert_eq!(usage.total, 150);
    }

    #[test]
    fn cache_serves_stale_until_forced() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(tmp.path());
        layout.ensure_tenant_tree("demo").unwrap();
        let cache = DiskUsageCache::with_ttl(layout.clone(), Duration::from_secs(3600));

        let before = cache.get("demo", false);
        assert_eq!(before.total, 0);

        fs::write(layout.workspace_dir("demo").join("new.bin"), vec![0u8; 10]).unwrap();
        assert_eq!(cache.get("demo", false).total, 0, "cached value survives");
        assert_eq!(cache.get("demo", true).total, 10, "forced refresh measures");
    }

    #[test]
    fn missing_tenant_counts_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskUsageCache::new(StateLayout::new(tmp.path()));
        assert_eq!(cache.get("ghost", true), DiskUsageBytes::default());
    }
}
