//! Per-call method authorization.
//!
//! A pure function over the method name and the connection's handshake
//! metadata. Checks run in a fixed order; the tenant allow-list (check 3)
//! is the single most important safety rail of the gateway: a
//! tenant-authenticated connection can never reach a method outside it,
//! regardless of scopes.

use gatehouse_core::GatewayError;

use crate::connection::{ConnectionRecord, Role};

/// Scope names granted at the connect handshake.
pub mod scopes {
    /// Grants everything (subject to the node/tenant rails).
    pub const ADMIN: &str = "operator.admin";
    /// Read-only methods.
    pub const READ: &str = "operator.read";
    /// Mutating methods.
    pub const WRITE: &str = "operator.write";
    /// Approval-queue methods.
    pub const APPROVALS: &str = "operator.approvals";
    /// Device/node pairing methods.
    pub const PAIRING: &str = "operator.pairing";
}

/// Methods a `node`-role connection may call.
pub const NODE_METHODS: &[&str] = &[
    "health",
    "ping",
    "node.register",
    "node.event",
    "node.invoke.result",
];

/// The fixed tenant allow-list. Any method outside this set is rejected
/// for tenant-authenticated callers even with otherwise sufficient scope.
pub const TENANT_METHODS: &[&str] = &[
    // Health check
    "health",
    "ping",
    // Interactive terminals (full verb set)
    "terminal.spawn",
    "terminal.write",
    "terminal.resize",
    "terminal.close",
    "terminal.list",
    // Tenant self-management subset
    "tenant.get",
    "tenant.rotate",
    "tenant.backup",
    "tenant.backups.list",
    "tenant.restore",
    "tenant.delete",
    "tenant.usage",
    "tenant.quota.status",
    "tenant.usage.history",
    // Config overlay
    "config.get",
    "config.set",
    "config.patch",
    "config.schema",
    // Agent CRUD
    "agents.list",
    "agents.get",
    "agents.create",
    "agents.update",
    "agents.delete",
    // Sessions: list/preview only
    "sessions.list",
    "sessions.preview",
    // Cron CRUD plus run
    "cron.list",
    "cron.get",
    "cron.add",
    "cron.update",
    "cron.remove",
    "cron.enable",
    "cron.disable",
    "cron.run",
    "cron.runs",
    // Skills CRUD
    "skills.list",
    "skills.get",
    "skills.install",
    "skills.update",
    "skills.remove",
    // Channels
    "channels.start",
    "channels.stop",
    "channels.logout",
    "channels.status",
    // Voice wake
    "voicewake.get",
    "voicewake.set",
    // Device pairing
    "device.pair.request",
    "device.pair.approve",
    "device.pair.list",
    "device.pair.revoke",
    // Node pairing
    "node.pair.request",
    "node.pair.approve",
    "node.pair.list",
    "node.pair.revoke",
];

/// Method-name prefixes that always require admin scope.
const ADMIN_ONLY_PREFIXES: &[&str] = &["tenants.", "system.", "update."];

/// Authorize one method call for one connection.
///
/// Check order:
/// 1. Node role: only [`NODE_METHODS`].
/// 2. Non-operator roles are rejected.
/// 3. Tenant connections: only [`TENANT_METHODS`].
/// 4. Admin scope permits.
/// 5. Approvals and pairing methods need their dedicated scopes.
/// 6. Admin-only prefixes reject (admin already returned in 4).
/// 7. Read methods need read or write scope; write methods need write.
///
/// # Errors
///
/// [`GatewayError`] with `INVALID_REQUEST` for tenant allow-list misses,
/// `UNAUTHORIZED` otherwise.
pub fn authorize(method: &str, conn: &ConnectionRecord) -> Result<(), GatewayError> {
    // 1. Node connections get the node-callable set, nothing else.
    if conn.role == Role::Node {
        if NODE_METHODS.contains(&method) {
            return Ok(());
        }
        return Err(GatewayError::unauthorized(format!(
            "method {method} not available for node connections"
        )));
    }

    // 2. Anything else must be an operator.
    if conn.role != Role::Operator {
        return Err(GatewayError::unauthorized("operator role required"));
    }

    // 3. The tenant rail.
    if conn.tenant.is_some() && !TENANT_METHODS.contains(&method) {
        return Err(GatewayError::invalid_request(format!(
            "method {method} not available for tenant token"
        )));
    }

    // 4. Admin passes (the node/tenant rails above already applied).
    if conn.is_admin() {
        return Ok(());
    }

    // 5. Scope-specific method families.
    if method.starts_with("approvals.") {
        return require_scope(conn, scopes::APPROVALS, method);
    }
    if method.starts_with("device.pair") || method.starts_with("node.pair") {
        return require_scope(conn, scopes::PAIRING, method);
    }

    // 6. Admin-only namespaces (an admin connection returned above).
    if ADMIN_ONLY_PREFIXES.iter().any(|p| method.starts_with(p)) {
        return Err(GatewayError::unauthorized(format!(
            "method {method} requires admin scope"
        )));
    }

    // 7. Read/write split.
    if is_read_method(method) {
        if conn.has_scope(scopes::READ) || conn.has_scope(scopes::WRITE) {
            return Ok(());
        }
        return Err(GatewayError::unauthorized(format!(
            "method {method} requires read scope"
        )));
    }
    require_scope(conn, scopes::WRITE, method)
}

fn require_scope(conn: &ConnectionRecord, scope: &str, method: &str) -> Result<(), GatewayError> {
    if conn.has_scope(scope) {
        Ok(())
    } else {
        Err(GatewayError::unauthorized(format!(
            "method {method} requires {scope} scope"
        )))
    }
}

/// Read-only method classification.
fn is_read_method(method: &str) -> bool {
    matches!(method, "health" | "ping" | "status")
        || method.ends_with(".list")
        || method.ends_with(".get")
        || method.ends_with(".status")
        || method.ends_with(".preview")
        || method.ends_with(".schema")
        || method.ends_with(".runs")
        || method.ends_with(".usage")
        || method.ends_with(".usage.history")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::{ConnId, ErrorCode};
    use gatehouse_tenancy::{Quotas, TenantContext};
    use std::collections::HashSet;

    fn conn(role: Role, tenant: Option<&str>, scope_list: &[&str]) -> ConnectionRecord {
        ConnectionRecord {
            conn_id: ConnId::new(),
            tenant: tenant.map(|t| TenantContext {
                tenant_id: t.to_string(),
                state_dir: std::path::PathBuf::from("/tmp"),
                display_name: None,
                quotas: Quotas::default(),
            }),
            remote_ip: None,
            role,
            scopes: scope_list.iter().map(|s| (*s).to_string()).collect::<HashSet<_>>(),
        }
    }

    #[test]
    fn node_connections_are_fenced() {
        let node = conn(Role::Node, None, &[scopes::ADMIN]);
        assert!(authorize("health", &node).is_ok());
        assert!(authorize("node.event", &node).is_ok());
        // Even admin scope does not open the rest of the surface.
        let err = authorize("tenants.list", &node).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert!(authorize("terminal.spawn", &node).is_err());
    }

    #[test]
    fn tenant_allow_list_blocks_regardless_of_scope() {
        let tenant = conn(
            Role::Operator,
            Some("tenant-a"),
            &[scopes::READ, scopes::WRITE],
        );
        for method in ["wizard.start", "status", "tenants.list", "system.restart"] {
            let err = authorize(method, &tenant).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidRequest, "{method}");
            assert!(
                err.message.contains("not available for tenant token"),
                "{method}: {}",
                err.message
            );
        }
    }

    #[test]
    fn tenant_allow_list_blocks_even_admin_scoped_tenants() {
        let tenant = conn(Role::Operator, Some("tenant-a"), &[scopes::ADMIN]);
        let err = authorize("tenants.list", &tenant).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        // Allow-listed methods still work for the admin-scoped tenant.
        assert!(authorize("terminal.spawn", &tenant).is_ok());
    }

    #[test]
    fn tenant_can_use_allow_listed_methods() {
        let tenant = conn(
            Role::Operator,
            Some("tenant-a"),
            &[scopes::READ, scopes::WRITE],
        );
        for method in [
            "health",
            "terminal.spawn",
            "terminal.list",
            "tenant.get",
            "tenant.usage",
            "config.patch",
            "cron.add",
            "cron.run",
            "sessions.list",
        ] {
            assert!(authorize(method, &tenant).is_ok(), "{method}");
        }
    }

    #[test]
    fn admin_scope_permits_admin_methods() {
        let admin = conn(Role::Operator, None, &[scopes::ADMIN]);
        assert!(authorize("tenants.create", &admin).is_ok());
        assert!(authorize("status", &admin).is_ok());
        assert!(authorize("terminal.list", &admin).is_ok());
    }

    #[test]
    fn admin_prefixes_reject_non_admin_operators() {
        let operator = conn(Role::Operator, None, &[scopes::READ, scopes::WRITE]);
        for method in ["tenants.create", "tenants.list", "system.restart"] {
            let err = authorize(method, &operator).unwrap_err();
            assert_eq!(err.code, ErrorCode::Unauthorized, "{method}");
        }
    }

    #[test]
    fn read_write_scope_split() {
        let reader = conn(Role::Operator, None, &[scopes::READ]);
        assert!(authorize("sessions.list", &reader).is_ok());
        assert!(authorize("status", &reader).is_ok());
        let err = authorize("cron.add", &reader).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let writer = conn(Role::Operator, None, &[scopes::WRITE]);
        assert!(authorize("cron.add", &writer).is_ok());
        assert!(authorize("sessions.list", &writer).is_ok(), "write implies read");

        let scopeless = conn(Role::Operator, None, &[]);
        assert!(authorize("sessions.list", &scopeless).is_err());
    }

    #[test]
    fn pairing_requires_dedicated_scope() {
        let writer = conn(Role::Operator, None, &[scopes::WRITE]);
        assert!(authorize("device.pair.request", &writer).is_err());

        let pairer = conn(Role::Operator, None, &[scopes::PAIRING]);
        assert!(authorize("device.pair.request", &pairer).is_ok());
        assert!(authorize("node.pair.approve", &pairer).is_ok());
    }

    #[test]
    fn approvals_require_dedicated_scope() {
        let writer = conn(Role::Operator, None, &[scopes::WRITE]);
        assert!(authorize("approvals.respond", &writer).is_err());
        let approver = conn(Role::Operator, None, &[scopes::APPROVALS]);
        assert!(authorize("approvals.respond", &approver).is_ok());
    }

    #[test]
    fn allow_list_size_is_stable() {
        // The enumerated set is a contract; additions are deliberate.
        assert!(TENANT_METHODS.len() >= 50);
        assert!(!TENANT_METHODS.contains(&"status"));
        assert!(!TENANT_METHODS.contains(&"wizard.start"));
    }
}
