//! Sliding-window request rate limiting.
//!
//! Two bounded windows of request timestamps (trailing minute, trailing
//! hour) persisted per tenant at `usage/rate-limits.json`. Windows are
//! pruned on every access before the check.

use std::fs;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TenancyError, TenancyResult};
use crate::quota::Quotas;
use crate::usage::{UsageLedger, hold};

/// Hard cap on stored timestamps per window, independent of quota config.
const MAX_WINDOW_ENTRIES: usize = 10_000;

/// Persisted window state. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RateLimitState {
    minute: Vec<i64>,
    hour: Vec<i64>,
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// When denied, how long until the oldest in-window entry expires.
    pub retry_after_ms: u64,
    /// Requests in the trailing minute (including this one when allowed).
    pub minute_count: u64,
    /// Requests in the trailing hour (including this one when allowed).
    pub hour_count: u64,
}

impl UsageLedger {
    /// Check the per-minute and per-hour request limits and, when allowed,
    /// record the request in both windows and the usage snapshot.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn check_and_record_request(
        &self,
        tenant_id: &str,
        quotas: &Quotas,
    ) -> TenancyResult<RateCheck> {
        self.check_and_record_request_at(tenant_id, quotas, Utc::now())
    }

    /// [`Self::check_and_record_request`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization failures.
    pub fn check_and_record_request_at(
        &self,
        tenant_id: &str,
        quotas: &Quotas,
        now: DateTime<Utc>,
    ) -> TenancyResult<RateCheck> {
        let lock = self.tenant_lock(tenant_id);
        let check;
        {
            let _guard = hold(&lock);
            let path = self.layout().rate_limits_file(tenant_id);
            let mut state: RateLimitState = match fs::read(&path) {
                Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => RateLimitState::default(),
                Err(e) => return Err(TenancyError::io(path, e)),
            };

            let now_ms = now.timestamp_millis();
            prune(&mut state.minute, now_ms, Duration::minutes(1));
            prune(&mut state.hour, now_ms, Duration::hours(1));

            let minute_denied = quotas
                .requests_per_minute
                .is_some_and(|limit| state.minute.len() as u64 >= limit);
            let hour_denied = quotas
                .requests_per_hour
                .is_some_and(|limit| state.hour.len() as u64 >= limit);

            check = if minute_denied {
                RateCheck {
                    allowed: false,
                    retry_after_ms: retry_after(&state.minute, now_ms, Duration::minutes(1)),
                    minute_count: state.minute.len() as u64,
                    hour_count: state.hour.len() as u64,
                }
            } else if hour_denied {
                RateCheck {
                    allowed: false,
                    retry_after_ms: retry_after(&state.hour, now_ms, Duration::hours(1)),
                    minute_count: state.minute.len() as u64,
                    hour_count: state.hour.len() as u64,
                }
            } else {
                state.minute.push(now_ms);
                state.hour.push(now_ms);
                cap(&mut state.minute);
                cap(&mut state.hour);
                RateCheck {
                    allowed: true,
                    retry_after_ms: 0,
                    minute_count: state.minute.len() as u64,
                    hour_count: state.hour.len() as u64,
                }
            };

            // Persist the pruned (and possibly extended) windows either way.
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| TenancyError::io(parent, e))?;
            }
            let bytes = serde_json::to_vec(&state)?;
            fs::write(&path, bytes).map_err(|e| TenancyError::io(path, e))?;
        }

        if check.allowed {
            self.record_request_counts(tenant_id, check.minute_count, check.hour_count)?;
        }
        Ok(check)
    }
}

fn prune(window: &mut Vec<i64>, now_ms: i64, span: Duration) {
    let cutoff = now_ms.saturating_sub(span.num_milliseconds());
    window.retain(|&ts| ts > cutoff);
}

fn cap(window: &mut Vec<i64>) {
    if window.len() > MAX_WINDOW_ENTRIES {
        let excess = window.len().saturating_sub(MAX_WINDOW_ENTRIES);
        window.drain(..excess);
    }
}

fn retry_after(window: &[i64], now_ms: i64, span: Duration) -> u64 {
    let oldest = window.iter().copied().min().unwrap_or(now_ms);
    let expires = oldest.saturating_add(span.num_milliseconds());
    u64::try_from(expires.saturating_sub(now_ms)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::StateLayout;

    fn quotas(per_minute: Option<u64>, per_hour: Option<u64>) -> Quotas {
        Quotas {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            ..Quotas::default()
        }
    }

    fn ledger() -> (tempfile::TempDir, UsageLedger) {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::new(StateLayout::new(tmp.path()));
        (tmp, ledger)
    }

    #[test]
    fn unlimited_when_no_quota() {
        let (_tmp, ledger) = ledger();
        for _ in 0..50 {
            let check = ledger
                .check_and_record_request("demo", &Quotas::default())
                .unwrap();
            assert!(check.allowed);
        }
    }

    #[test]
    fn denies_at_minute_limit_with_retry_hint() {
        let (_tmp, ledger) = ledger();
        let q = quotas(Some(3), None);
        let now = Utc::now();
        for _ in 0..3 {
            assert!(
                ledger
                    .check_and_record_request_at("demo", &q, now)
                    .unwrap()
                    .allowed
            );
        }
        let denied = ledger.check_and_record_request_at("demo", &q, now).unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
        assert!(denied.retry_after_ms <= 60_000);
    }

    #[test]
    fn window_expiry_readmits() {
        let (_tmp, ledger) = ledger();
        let q = quotas(Some(1), None);
        let t0 = Utc::now();
        assert!(
            ledger
                .check_and_record_request_at("demo", &q, t0)
                .unwrap()
                .allowed
        );
        assert!(
            !ledger
                .check_and_record_request_at("demo", &q, t0)
                .unwrap()
                .allowed
        );
        let later = t0 + Duration::seconds(61);
        assert!(
            ledger
                .check_and_record_request_at("demo", &q, later)
                .unwrap()
                .allowed
        );
    }

    #[test]
    fn hour_limit_applies_after_minute_passes() {
        let (_tmp, ledger) = ledger();
        let q = quotas(None, Some(2));
        let t0 = Utc::now();
        assert!(
            ledger
                .check_and_record_request_at("demo", &q, t0)
                .unwrap()
                .allowed
        );
        let t1 = t0 + Duration::minutes(2);
        assert!(
            ledger
                .check_and_record_request_at("demo", &q, t1)
                .unwrap()
                .allowed
        );
        let t2 = t0 + Duration::minutes(4);
        let denied = ledger.check_and_record_request_at("demo", &q, t2).unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }

    #[test]
    fn usage_snapshot_tracks_request_counters() {
        let (_tmp, ledger) = ledger();
        let q = quotas(Some(10), Some(100));
        ledger.check_and_record_request("demo", &q).unwrap();
        ledger.check_and_record_request("demo", &q).unwrap();
        let snapshot = ledger.load_usage("demo").unwrap();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_this_minute, 2);
        assert_eq!(snapshot.requests_this_hour, 2);
    }
}
