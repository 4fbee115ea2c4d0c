//! Quota configuration and the pre-request gate.
//!
//! The gate runs checks in a fixed priority order: rate windows first, then
//! cumulative caps (tokens → cost → disk → concurrent sessions). Soft-limit
//! crossings never deny; they attach a warning to the allowed result.

use serde::{Deserialize, Serialize};

use crate::error::TenancyResult;
use crate::usage::{UsageLedger, UsageSnapshot};

/// Per-tenant quota configuration. Absent fields mean unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Quotas {
    /// Monthly token hard cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_tokens_hard: Option<u64>,
    /// Monthly token soft cap (warning only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_tokens_soft: Option<u64>,
    /// Monthly cost hard cap, in cents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_cost_cents_hard: Option<u64>,
    /// Monthly cost soft cap, in cents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_cost_cents_soft: Option<u64>,
    /// Disk usage cap, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_bytes: Option<u64>,
    /// Concurrent session cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrent_sessions: Option<u64>,
    /// Requests per trailing minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    /// Requests per trailing hour.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u64>,
    /// Sandbox CPU percentage cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_cpu_percent: Option<u64>,
    /// Sandbox memory cap, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_memory_bytes: Option<u64>,
    /// Sandbox disk cap, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_disk_bytes: Option<u64>,
    /// Sandbox process-count cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_pids: Option<u64>,
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// A monthly token or cost hard cap is reached.
    QuotaExceeded,
    /// A request-rate window is full.
    RateLimited,
    /// The disk cap is reached.
    DiskFull,
    /// The concurrent-session cap is reached.
    SessionsExceeded,
}

/// Outcome of the pre-request quota gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Request may proceed; `warning` is set when a soft limit is crossed.
    Allowed {
        /// Human-readable soft-limit warning, if any.
        warning: Option<String>,
    },
    /// Request is denied.
    Denied {
        /// Machine-readable reason.
        reason: DenialReason,
        /// Human-readable message.
        message: String,
        /// Retry hint for `rate_limited` denials, in milliseconds.
        retry_after_ms: Option<u64>,
    },
}

impl QuotaDecision {
    /// Whether the request may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Percentage of a limit consumed. Deliberately not clamped: values over
/// 100 tell callers the limit is already breached rather than approaching.
#[must_use]
pub fn percent_used(used: u64, limit: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    used.saturating_mul(100).checked_div(limit).unwrap_or(0)
}

/// The pre-request quota gate.
pub struct QuotaGate {
    ledger: std::sync::Arc<UsageLedger>,
}

impl QuotaGate {
    /// Create a gate over the given ledger.
    #[must_use]
    pub fn new(ledger: std::sync::Arc<UsageLedger>) -> Self {
        Self { ledger }
    }

    /// Run the full check sequence for one inbound request.
    ///
    /// Order: rate windows → monthly tokens → monthly cost → disk →
    /// concurrent sessions. The rate check records the request when it
    /// passes, so a later cumulative-cap denial still counts against the
    /// rate windows — matching the "authorization errors update rate-limit
    /// state" rule.
    ///
    /// # Errors
    ///
    /// Propagates ledger I/O failures.
    pub fn check_before_request(
        &self,
        tenant_id: &str,
        quotas: &Quotas,
    ) -> TenancyResult<QuotaDecision> {
        let rate = self.ledger.check_and_record_request(tenant_id, quotas)?;
        if !rate.allowed {
            return Ok(QuotaDecision::Denied {
                reason: DenialReason::RateLimited,
                message: "request rate limit exceeded".to_string(),
                retry_after_ms: Some(rate.retry_after_ms),
            });
        }

        let usage = self.ledger.load_usage(tenant_id)?;

        if let Some(hard) = quotas.monthly_tokens_hard
            && usage.total_tokens >= hard
        {
            return Ok(QuotaDecision::Denied {
                reason: DenialReason::QuotaExceeded,
                message: format!(
                    "monthly token quota exhausted ({} of {hard})",
                    usage.total_tokens
                ),
                retry_after_ms: None,
            });
        }

        if let Some(hard) = quotas.monthly_cost_cents_hard
            && usage.cost_cents >= hard
        {
            return Ok(QuotaDecision::Denied {
                reason: DenialReason::QuotaExceeded,
                message: format!(
                    "monthly cost quota exhausted ({} of {hard} cents)",
                    usage.cost_cents
                ),
                retry_after_ms: None,
            });
        }

        if let Some(cap) = quotas.disk_bytes
            && usage.disk.total >= cap
        {
            return Ok(QuotaDecision::Denied {
                reason: DenialReason::DiskFull,
                message: format!("disk quota exhausted ({} of {cap} bytes)", usage.disk.total),
                retry_after_ms: None,
            });
        }

        if let Some(cap) = quotas.concurrent_sessions
            && usage.active_sessions >= cap
        {
            return Ok(QuotaDecision::Denied {
                reason: DenialReason::SessionsExceeded,
                message: format!("concurrent session limit reached ({cap})"),
                retry_after_ms: None,
            });
        }

        Ok(QuotaDecision::Allowed {
            warning: soft_limit_warning(&usage, quotas),
        })
    }
}

fn soft_limit_warning(usage: &UsageSnapshot, quotas: &Quotas) -> Option<String> {
    if let Some(soft) = quotas.monthly_tokens_soft
        && usage.total_tokens >= soft
    {
        let percent = quotas
            .monthly_tokens_hard
            .map_or(100, |hard| percent_used(usage.total_tokens, hard));
        return Some(format!(
            "token usage is at {percent}% of the monthly quota ({} tokens)",
            usage.total_tokens
        ));
    }
    if let Some(soft) = quotas.monthly_cost_cents_soft
        && usage.cost_cents >= soft
    {
        let percent = quotas
            .monthly_cost_cents_hard
            .map_or(100, |hard| percent_used(usage.cost_cents, hard));
        return Some(format!(
            "cost is at {percent}% of the monthly quota ({} cents)",
            usage.cost_cents
        ));
    }
    None
}
