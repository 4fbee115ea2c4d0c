//! Scheduled job records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    /// Job id (UUID string).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Disabled jobs are kept but never fired.
    pub enabled: bool,
    /// Cron schedule expression.
    pub schedule: String,
    /// Payload handed to the agent runner.
    pub payload: Value,
    /// Delivery descriptor, passed through to the run events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Value>,
    /// Target agent id; falls back to the tenant's default agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Opaque state blob (last run bookkeeping).
    #[serde(default)]
    pub state: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Construct a new enabled job with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            schedule: schedule.into(),
            payload,
            delivery: None,
            agent_id: None,
            state: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Selective field update for a job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobUpdate {
    /// Replace the name.
    pub name: Option<String>,
    /// Replace the enabled flag.
    pub enabled: Option<bool>,
    /// Replace the schedule expression.
    pub schedule: Option<String>,
    /// Replace the payload.
    pub payload: Option<Value>,
    /// Replace the delivery descriptor.
    pub delivery: Option<Value>,
    /// Replace the target agent.
    pub agent_id: Option<String>,
}

/// Validate a cron schedule expression.
///
/// # Errors
///
/// Returns the parse error for an invalid expression.
pub fn validate_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(expr)
}

/// The first occurrence of `schedule` strictly after `since`, if it is not
/// after `now`. This is the firing predicate: one tick fires everything
/// that came due since the previous tick.
#[must_use]
pub fn due_between(
    schedule: &Schedule,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(&since).next().filter(|t| *t <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schedule_validation() {
        assert!(validate_schedule("0 * * * * *").is_ok());
        assert!(validate_schedule("0 0 12 * * Mon-Fri").is_ok());
        assert!(validate_schedule("not a schedule").is_err());
    }

    #[test]
    fn due_between_fires_once_per_occurrence() {
        // Every minute, on the minute.
        let schedule = validate_schedule("0 * * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 30).unwrap();

        // 20 seconds later: no full minute has passed.
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 50).unwrap();
        assert!(due_between(&schedule, t0, t1).is_none());

        // 40 seconds later: 10:01:00 came due.
        let t2 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 10).unwrap();
        let fired = due_between(&schedule, t0, t2).unwrap();
        assert_eq!(fired, Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 0).unwrap());

        // Next window starts after t2: nothing due again until 10:02:00.
        assert!(due_between(&schedule, t2, t2).is_none());
    }

    #[test]
    fn job_serde_round_trip() {
        let job = ScheduledJob::new("nightly", "0 0 3 * * *", serde_json::json!({"message": "hi"}));
        let json = serde_json::to_string(&job).unwrap();
        let back: ScheduledJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.schedule, "0 0 3 * * *");
        assert!(back.enabled);
    }
}
