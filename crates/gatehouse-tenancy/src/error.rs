//! Tenancy error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the tenant registry and usage ledger.
#[derive(Debug, Error)]
pub enum TenancyError {
    /// Tenant id failed the `^[a-z0-9][a-z0-9_-]{0,31}$` pattern.
    #[error("invalid tenant id: {0:?} (lowercase alphanumerics, '_' and '-', max 32 chars)")]
    InvalidTenantId(String),

    /// Tenant already exists.
    #[error("tenant already exists: {0}")]
    TenantExists(String),

    /// Tenant does not exist.
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// File could not be read or written.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A persisted document failed to serialize.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TenancyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias.
pub type TenancyResult<T> = Result<T, TenancyError>;
