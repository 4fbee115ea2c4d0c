//! Scheduled jobs: per-tenant stores, the firing loop, and the supervisor
//! that owns one global scheduler plus one per tenant.
//!
//! Cron-initiated agent runs live in a session namespace of their own
//! (`tenant:{tenantId}:cron:{jobId}`), distinct from user sessions, and
//! their lifecycle events flow back to the owning tenant's broadcast scope
//! with backpressure-drop semantics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod job;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use job::{JobUpdate, ScheduledJob, validate_schedule};
pub use scheduler::{Scheduler, SchedulerScope};
pub use store::JobStore;
pub use supervisor::SchedulerSupervisor;
