//! Tenant self-management (`tenant.*`) and admin tenant administration
//! (`tenants.*`).
//!
//! The authorizer keeps the two families apart: `tenant.*` is on the
//! tenant allow-list and always targets the caller's own tenant for
//! tenant-authenticated connections; `tenants.*` is admin-only.

use serde::Deserialize;
use serde_json::{Value, json};

use gatehouse_core::GatewayError;
use gatehouse_tenancy::{Quotas, TenantRecord, TenantUpdate, quota::percent_used};

use crate::dispatch::Dispatcher;
use crate::handlers::{backup_err, target_tenant, teardown_tenant, tenancy_err};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct TenantIdParams {
    tenant_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DeleteParams {
    tenant_id: Option<String>,
    delete_data: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    tenant_id: String,
    display_name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UpdateParams {
    tenant_id: Option<String>,
    display_name: Option<String>,
    disabled: Option<bool>,
    quotas: Option<Quotas>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UsageParams {
    tenant_id: Option<String>,
    refresh_disk: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct BackupParams {
    tenant_id: Option<String>,
    key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreParams {
    #[serde(default)]
    tenant_id: Option<String>,
    key: String,
}

/// Public view of a tenant record. The token hash never leaves the
/// registry.
fn tenant_view(tenant_id: &str, record: &TenantRecord) -> Value {
    json!({
        "tenantId": tenant_id,
        "displayName": record.display_name,
        "disabled": record.disabled,
        "createdAt": record.created_at,
        "lastSeenAt": record.last_seen_at,
        "quotas": record.quotas,
    })
}

fn quota_line(used: u64, limit: Option<u64>) -> Value {
    match limit {
        Some(limit) => json!({
            "used": used,
            "limit": limit,
            "percent": percent_used(used, limit),
        }),
        None => json!({ "used": used, "limit": Value::Null }),
    }
}

pub(super) fn register(dispatcher: &mut Dispatcher) {
    // ---- tenant.* (self-management subset) ----

    dispatcher.register("tenant.get", |gateway, ctx| async move {
        let params: TenantIdParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let record = gateway
            .registry
            .get(&tenant_id)
            .map_err(tenancy_err)?
            .ok_or_else(|| GatewayError::not_found(format!("tenant not found: {tenant_id}")))?;
        Ok(tenant_view(&tenant_id, &record))
    });

    dispatcher.register("tenant.rotate", |gateway, ctx| async move {
        let params: TenantIdParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let token = gateway.registry.rotate(&tenant_id).map_err(tenancy_err)?;
        Ok(json!({ "token": token }))
    });

    dispatcher.register("tenant.delete", |gateway, ctx| async move {
        let params: DeleteParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        teardown_tenant(&gateway, &tenant_id);
        gateway
            .registry
            .remove(&tenant_id, params.delete_data)
            .map_err(tenancy_err)?;
        Ok(json!({ "removed": tenant_id }))
    });

    dispatcher.register("tenant.usage", |gateway, ctx| async move {
        let params: UsageParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        if params.refresh_disk {
            // The walk is slow by design; only on explicit request.
            let disk = gateway.disk.get(&tenant_id, true);
            gateway
                .ledger
                .record_disk_usage(&tenant_id, disk)
                .map_err(tenancy_err)?;
        }
        let usage = gateway.ledger.load_usage(&tenant_id).map_err(tenancy_err)?;
        Ok(serde_json::to_value(usage).unwrap_or_default())
    });

    dispatcher.register("tenant.quota.status", |gateway, ctx| async move {
        let params: TenantIdParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let record = gateway
            .registry
            .get(&tenant_id)
            .map_err(tenancy_err)?
            .ok_or_else(|| GatewayError::not_found(format!("tenant not found: {tenant_id}")))?;
        let quotas = record.quotas.unwrap_or_default();
        let usage = gateway.ledger.load_usage(&tenant_id).map_err(tenancy_err)?;
        Ok(json!({
            "tenantId": tenant_id,
            "period": usage.period,
            "tokens": quota_line(usage.total_tokens, quotas.monthly_tokens_hard),
            "costCents": quota_line(usage.cost_cents, quotas.monthly_cost_cents_hard),
            "diskBytes": quota_line(usage.disk.total, quotas.disk_bytes),
            "activeSessions": quota_line(usage.active_sessions, quotas.concurrent_sessions),
        }))
    });

    dispatcher.register("tenant.usage.history", |gateway, ctx| async move {
        let params: TenantIdParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let dir = gateway.layout.usage_dir(&tenant_id);
        let mut periods = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.filter_map(Result::ok) {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(period) = name.strip_suffix(".json") else {
                    continue;
                };
                if !is_period_label(period) {
                    continue;
                }
                if let Ok(bytes) = std::fs::read(entry.path())
                    && let Ok(snapshot) = serde_json::from_slice::<Value>(&bytes)
                {
                    periods.push(snapshot);
                }
            }
        }
        periods.sort_by_key(|s| s["period"].as_str().map(str::to_string));
        periods.reverse();
        Ok(json!({ "periods": periods }))
    });

    dispatcher.register("tenant.backup", |gateway, ctx| async move {
        let params: BackupParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let info = gateway
            .backups
            .backup(&tenant_id, params.key)
            .await
            .map_err(backup_err)?;
        Ok(serde_json::to_value(info).unwrap_or_default())
    });

    dispatcher.register("tenant.backups.list", |gateway, ctx| async move {
        let params: TenantIdParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let backups = gateway
            .backups
            .list_backups(&tenant_id)
            .await
            .map_err(backup_err)?;
        Ok(json!({ "backups": backups }))
    });

    dispatcher.register("tenant.restore", |gateway, ctx| async move {
        let params: RestoreParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        // Only an admin connection may conjure a missing tenant.
        let create_if_missing = ctx.conn.record().tenant.is_none() && ctx.conn.record().is_admin();
        let report = gateway
            .backups
            .restore(&tenant_id, &params.key, create_if_missing)
            .await
            .map_err(backup_err)?;
        Ok(json!({
            "extracted": report.extracted,
            "skipped": report.skipped,
        }))
    });

    // ---- tenants.* (admin administration) ----

    dispatcher.register("tenants.create", |gateway, ctx| async move {
        let params: CreateParams = ctx.params()?;
        let (record, token) = gateway
            .registry
            .create(&params.tenant_id, params.display_name)
            .map_err(tenancy_err)?;
        Ok(json!({
            "tenant": tenant_view(&params.tenant_id, &record),
            "token": token,
        }))
    });

    dispatcher.register("tenants.list", |gateway, _ctx| async move {
        let ids = gateway.registry.list().map_err(tenancy_err)?;
        let mut tenants = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = gateway.registry.get(&id).map_err(tenancy_err)? {
                tenants.push(tenant_view(&id, &record));
            }
        }
        Ok(json!({ "tenants": tenants }))
    });

    dispatcher.register("tenants.get", |gateway, ctx| async move {
        let params: TenantIdParams = ctx.params()?;
        let tenant_id = params
            .tenant_id
            .ok_or_else(|| GatewayError::invalid_request("tenantId is required"))?;
        let record = gateway
            .registry
            .get(&tenant_id)
            .map_err(tenancy_err)?
            .ok_or_else(|| GatewayError::not_found(format!("tenant not found: {tenant_id}")))?;
        Ok(tenant_view(&tenant_id, &record))
    });

    dispatcher.register("tenants.update", |gateway, ctx| async move {
        let params: UpdateParams = ctx.params()?;
        let tenant_id = params
            .tenant_id
            .ok_or_else(|| GatewayError::invalid_request("tenantId is required"))?;
        let disabling = params.disabled == Some(true);
        let record = gateway
            .registry
            .update(
                &tenant_id,
                TenantUpdate {
                    display_name: params.display_name,
                    disabled: params.disabled,
                    quotas: params.quotas,
                },
            )
            .map_err(tenancy_err)?;
        if disabling {
            teardown_tenant(&gateway, &tenant_id);
        }
        Ok(tenant_view(&tenant_id, &record))
    });

    dispatcher.register("tenants.remove", |gateway, ctx| async move {
        let params: DeleteParams = ctx.params()?;
        let tenant_id = params
            .tenant_id
            .ok_or_else(|| GatewayError::invalid_request("tenantId is required"))?;
        teardown_tenant(&gateway, &tenant_id);
        gateway
            .registry
            .remove(&tenant_id, params.delete_data)
            .map_err(tenancy_err)?;
        Ok(json!({ "removed": tenant_id }))
    });

    dispatcher.register("tenants.rotate", |gateway, ctx| async move {
        let params: TenantIdParams = ctx.params()?;
        let tenant_id = params
            .tenant_id
            .ok_or_else(|| GatewayError::invalid_request("tenantId is required"))?;
        let token = gateway.registry.rotate(&tenant_id).map_err(tenancy_err)?;
        Ok(json!({ "token": token }))
    });
}

fn is_period_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 7
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit)
}
