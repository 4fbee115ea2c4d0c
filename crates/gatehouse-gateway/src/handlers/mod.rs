//! RPC method handlers.

use std::sync::Arc;

use gatehouse_core::{GatewayError, GatewayResult};
use gatehouse_sched::store::StoreError;
use gatehouse_tenancy::TenancyError;

use crate::dispatch::{Dispatcher, RequestCtx};
use crate::server::Gateway;

mod config;
mod cron;
mod sessions;
mod system;
mod tenant;
mod terminal;

/// Build the full method table.
#[must_use]
pub fn build_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    system::register(&mut dispatcher);
    tenant::register(&mut dispatcher);
    terminal::register(&mut dispatcher);
    cron::register(&mut dispatcher);
    config::register(&mut dispatcher);
    sessions::register(&mut dispatcher);
    dispatcher
}

/// Resolve which tenant a tenant-scoped method targets.
///
/// Tenant connections always act on their own tenant; a `tenantId` param
/// naming anyone else is refused. Non-tenant (operator/admin) callers must
/// name a tenant explicitly.
pub(crate) fn target_tenant(
    ctx: &RequestCtx,
    requested: Option<String>,
) -> GatewayResult<String> {
    match ctx.conn.record().tenant_id() {
        Some(own) => match requested {
            Some(req) if req != own => Err(GatewayError::unauthorized(
                "tenantId does not match authenticated tenant",
            )),
            _ => Ok(own.to_string()),
        },
        None => requested.ok_or_else(|| GatewayError::invalid_request("tenantId is required")),
    }
}

/// Tear down a tenant's live resources: open connections, PTYs, and its
/// scheduler. Invoked on disable and delete.
pub(crate) fn teardown_tenant(gateway: &Arc<Gateway>, tenant_id: &str) {
    gateway.terminals.close_all_tenant_terminals(tenant_id);
    gateway.schedulers.remove(tenant_id);
    gateway.connections.evict_tenant(tenant_id);
}

pub(crate) fn tenancy_err(err: TenancyError) -> GatewayError {
    match err {
        TenancyError::InvalidTenantId(_) | TenancyError::TenantExists(_) => {
            GatewayError::invalid_request(err.to_string())
        },
        TenancyError::TenantNotFound(_) => GatewayError::not_found(err.to_string()),
        TenancyError::Io { .. } | TenancyError::Serialize(_) => {
            GatewayError::unavailable(err.to_string())
        },
    }
}

pub(crate) fn store_err(err: StoreError) -> GatewayError {
    match err {
        StoreError::JobNotFound(_) => GatewayError::not_found(err.to_string()),
        StoreError::InvalidSchedule(_) => GatewayError::invalid_request(err.to_string()),
        StoreError::Io { .. } | StoreError::Serialize(_) => {
            GatewayError::unavailable(err.to_string())
        },
    }
}

pub(crate) fn backup_err(err: gatehouse_backup::BackupError) -> GatewayError {
    use gatehouse_backup::{BackupError, ObjectStoreError};
    match err {
        BackupError::TenantNotFound(_) | BackupError::StateDirMissing(_) => {
            GatewayError::not_found(err.to_string())
        },
        BackupError::Store(ObjectStoreError::NotFound(_)) => {
            GatewayError::not_found(err.to_string())
        },
        BackupError::Store(ObjectStoreError::InvalidKey(_)) => {
            GatewayError::invalid_request(err.to_string())
        },
        BackupError::Tenancy(e) => tenancy_err(e),
        BackupError::Archive(_) | BackupError::Store(_) | BackupError::Io(_) => {
            GatewayError::unavailable(err.to_string())
        },
    }
}
