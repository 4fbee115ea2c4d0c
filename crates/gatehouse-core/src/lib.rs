//! Core types shared across the Gatehouse gateway.
//!
//! This crate is the dependency root of the workspace: the session-key
//! algebra, tenant/agent id validation, the wire error taxonomy, the event
//! sink and agent runner seams, the persisted state layout, and gateway
//! configuration. It performs no network I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod paths;
pub mod runner;
pub mod session_key;

pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use events::{ConnId, EventSink, NullSink};
pub use id::{is_valid_tenant_id, normalize_agent_id};
pub use paths::StateLayout;
pub use runner::{AgentRunner, ChatMessage, EchoRunner, RunInput, RunOutput, RunnerError};
pub use session_key::{
    ParsedTenantKey, SessionKeyError, build_tenant_session_key, parse_tenant_session_key,
    scope_session_key_to_tenant,
};
