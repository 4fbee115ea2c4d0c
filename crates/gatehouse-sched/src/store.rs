//! Per-scope job store: a JSON document of [`ScheduledJob`] records.
//!
//! Each tenant has its own store (`tenants/{id}/cron/jobs.json`), distinct
//! from the global store (`cron/jobs.json`). Same
//! load-then-mutate-then-save discipline as the tenant registry, but the
//! lock is per store — stores of unrelated tenants never contend.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::job::{JobUpdate, ScheduledJob, validate_schedule};

/// Job store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown job id.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Invalid cron expression.
    #[error("invalid schedule expression: {0}")]
    InvalidSchedule(#[from] cron::error::Error),

    /// Filesystem failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Document failed to serialize.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result alias.
pub type StoreResult<T> = Result<T, StoreError>;

/// A single scope's job document.
pub struct JobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    /// Open (lazily) the store at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// All jobs. A missing or unreadable document is empty.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures other than not-found.
    pub fn load(&self) -> StoreResult<Vec<ScheduledJob>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "job store unreadable, treating as empty");
                Vec::new()
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Whether the store currently holds any jobs.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.load()?.is_empty())
    }

    /// Look up one job.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn get(&self, job_id: &str) -> StoreResult<Option<ScheduledJob>> {
        Ok(self.load()?.into_iter().find(|j| j.id == job_id))
    }

    /// Add a job after validating its schedule expression.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidSchedule`] plus I/O failures.
    pub fn add(&self, job: ScheduledJob) -> StoreResult<ScheduledJob> {
        validate_schedule(&job.schedule)?;
        self.mutate(|jobs| {
            jobs.push(job.clone());
            Ok(())
        })?;
        Ok(job)
    }

    /// Apply a selective update.
    ///
    /// # Errors
    ///
    /// [`StoreError::JobNotFound`], [`StoreError::InvalidSchedule`], plus
    /// I/O failures.
    pub fn update(&self, job_id: &str, update: JobUpdate) -> StoreResult<ScheduledJob> {
        if let Some(expr) = &update.schedule {
            validate_schedule(expr)?;
        }
        let mut updated = None;
        self.mutate(|jobs| {
            let job = jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
            if let Some(name) = update.name.clone() {
                job.name = name;
            }
            if let Some(enabled) = update.enabled {
                job.enabled = enabled;
            }
            if let Some(schedule) = update.schedule.clone() {
                job.schedule = schedule;
            }
            if let Some(payload) = update.payload.clone() {
                job.payload = payload;
            }
            if let Some(delivery) = update.delivery.clone() {
                job.delivery = Some(delivery);
            }
            if let Some(agent) = update.agent_id.clone() {
                job.agent_id = Some(agent);
            }
            job.updated_at = Utc::now();
            updated = Some(job.clone());
            Ok(())
        })?;
        updated.ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    /// Overwrite a job's opaque state blob.
    ///
    /// # Errors
    ///
    /// [`StoreError::JobNotFound`] plus I/O failures.
    pub fn set_state(&self, job_id: &str, state: serde_json::Value) -> StoreResult<()> {
        self.mutate(|jobs| {
            let job = jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
            job.state = state.clone();
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Remove a job.
    ///
    /// # Errors
    ///
    /// [`StoreError::JobNotFound`] plus I/O failures.
    pub fn remove(&self, job_id: &str) -> StoreResult<()> {
        self.mutate(|jobs| {
            let before = jobs.len();
            jobs.retain(|j| j.id != job_id);
            if jobs.len() == before {
                return Err(StoreError::JobNotFound(job_id.to_string()));
            }
            Ok(())
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut Vec<ScheduledJob>) -> StoreResult<()>) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut jobs = self.load()?;
        apply(&mut jobs)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let bytes = serde_json::to_vec_pretty(&jobs)?;
        fs::write(&self.path, bytes).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, JobStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path().join("cron/jobs.json"));
        (tmp, store)
    }

    #[test]
    fn empty_until_first_add() {
        let (_tmp, store) = store();
        assert!(store.is_empty().unwrap());
        store
            .add(ScheduledJob::new("j", "0 * * * * *", json!({})))
            .unwrap();
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn add_rejects_invalid_schedule() {
        let (_tmp, store) = store();
        let err = store
            .add(ScheduledJob::new("bad", "whenever", json!({})))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidSchedule(_)));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn update_and_remove() {
        let (_tmp, store) = store();
        let job = store
            .add(ScheduledJob::new("j", "0 * * * * *", json!({"message": "x"})))
            .unwrap();

        let updated = store
            .update(
                &job.id,
                JobUpdate {
                    enabled: Some(false),
                    name: Some("renamed".into()),
                    ..JobUpdate::default()
                },
            )
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.name, "renamed");

        store.remove(&job.id).unwrap();
        assert!(matches!(
            store.remove(&job.id),
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn update_unknown_job_fails() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.update("nope", JobUpdate::default()),
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn state_blob_persists() {
        let (_tmp, store) = store();
        let job = store
            .add(ScheduledJob::new("j", "0 * * * * *", json!({})))
            .unwrap();
        store
            .set_state(&job.id, json!({"lastRunAt": "2025-06-01T00:00:00Z"}))
            .unwrap();
        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.state["lastRunAt"], "2025-06-01T00:00:00Z");
    }
}
