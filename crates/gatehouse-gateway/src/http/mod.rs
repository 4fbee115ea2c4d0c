//! HTTP surfaces: the OpenAI-compatible `/v1` endpoints and the internal
//! control plane under `/internal/v1`. Both are thin adapters over the
//! same registry, quota gate, and agent runner the RPC surface uses.

pub mod auth;
pub mod compat;
pub mod control;
