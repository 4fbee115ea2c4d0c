//! Session-key algebra.
//!
//! Every logical multi-turn interaction is addressed by a session key.
//! Tenant-owned keys carry a `tenant:{tenantId}:` prefix; the scoping
//! function below is the single chokepoint that forces every key flowing
//! through a tenant-authenticated surface into that namespace.
//!
//! Pure functions, no I/O.

use thiserror::Error;

use crate::id::normalize_agent_id;

/// Default trailing segment for keys built without an explicit main key.
const DEFAULT_MAIN_KEY: &str = "main";

/// A parsed tenant-form session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTenantKey<'a> {
    /// The owning tenant id.
    pub tenant_id: &'a str,
    /// The agent id segment.
    pub agent_id: &'a str,
    /// Everything after `agent:{agentId}:`.
    pub rest: &'a str,
}

/// Error returned when a session key names a different tenant than the
/// authenticated one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session key tenant prefix does not match authenticated tenant")]
pub struct SessionKeyError;

/// Build a canonical tenant session key:
/// `tenant:{tenantId}:agent:{agentId}:{mainKey|"main"}`.
///
/// The tenant id is lowercased; the agent id is normalized (invalid
/// characters collapsed to `-`, clipped to 64 characters, falling back to
/// `main`).
#[must_use]
pub fn build_tenant_session_key(
    tenant_id: &str,
    agent_id: &str,
    main_key: Option<&str>,
) -> String {
    let tenant = tenant_id.to_ascii_lowercase();
    let agent = normalize_agent_id(agent_id);
    let rest = main_key.unwrap_or(DEFAULT_MAIN_KEY);
    format!("tenant:{tenant}:agent:{agent}:{rest}")
}

/// Parse a tenant-form session key.
///
/// Returns `None` if the key does not start with `tenant:` or lacks the
/// interior `agent:{id}:` segment.
#[must_use]
pub fn parse_tenant_session_key(key: &str) -> Option<ParsedTenantKey<'_>> {
    let after_tenant = key.strip_prefix("tenant:")?;
    let (tenant_id, remainder) = after_tenant.split_once(':')?;
    let after_agent = remainder.strip_prefix("agent:")?;
    let (agent_id, rest) = after_agent.split_once(':')?;
    if tenant_id.is_empty() || agent_id.is_empty() {
        return None;
    }
    Some(ParsedTenantKey {
        tenant_id,
        agent_id,
        rest,
    })
}

/// Force a session key into the authenticated tenant's namespace.
///
/// - No tenant context: the key passes through unchanged.
/// - Key already prefixed with `tenant:{tenantId}:`: unchanged.
/// - Key prefixed with a *different* tenant: [`SessionKeyError`].
/// - Anything else: prefixed with `tenant:{tenantId}:`.
///
/// Idempotent: scoping an already-scoped key is a no-op.
///
/// # Errors
///
/// Returns [`SessionKeyError`] when the key names another tenant.
pub fn scope_session_key_to_tenant(
    session_key: &str,
    tenant_id: Option<&str>,
) -> Result<String, SessionKeyError> {
    let Some(tenant_id) = tenant_id else {
        return Ok(session_key.to_string());
    };
    if let Some(after) = session_key.strip_prefix("tenant:") {
        let existing = after.split(':').next().unwrap_or(after);
        if existing == tenant_id {
            return Ok(session_key.to_string());
        }
        return Err(SessionKeyError);
    }
    Ok(format!("tenant:{tenant_id}:{session_key}"))
}
