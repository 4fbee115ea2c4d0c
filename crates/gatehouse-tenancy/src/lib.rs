//! Tenant identity, registry persistence, and the quota/usage ledger.
//!
//! The registry owns `tenants.json` (a single versioned JSON document,
//! mode 0600); the ledger owns the per-tenant files under
//! `tenants/{id}/usage/`. All mutation is load-then-mutate-then-save under
//! per-resource locks — registry writes take an exclusive advisory file
//! lock so the CLI and a running daemon never interleave; ledger writes are
//! sharded by tenant id so unrelated tenants never serialize.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod disk;
pub mod error;
pub mod quota;
pub mod rate_limit;
pub mod registry;
pub mod token;
pub mod usage;

pub use disk::DiskUsageCache;
pub use error::TenancyError;
pub use quota::{DenialReason, QuotaDecision, QuotaGate, Quotas};
pub use rate_limit::RateCheck;
pub use registry::{TenantContext, TenantRecord, TenantRegistry, TenantUpdate};
pub use usage::{DiskUsageBytes, TokenDelta, UsageLedger, UsageSnapshot};
