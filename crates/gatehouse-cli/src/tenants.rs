//! `gatehouse tenants …` subcommands.

use anyhow::{Context, Result, bail};
use serde_json::json;

use gatehouse_tenancy::{TenantRegistry, UsageLedger};

use crate::output::emit;
use crate::{confirm, require_valid_tenant_id};

pub(crate) fn create(
    registry: &TenantRegistry,
    tenant_id: &str,
    display_name: Option<String>,
    json: bool,
) -> Result<()> {
    require_valid_tenant_id(tenant_id)?;
    let (record, token) = registry
        .create(tenant_id, display_name)
        .with_context(|| format!("failed to create tenant {tenant_id}"))?;

    emit(
        json,
        &json!({
            "tenantId": tenant_id,
            "displayName": record.display_name,
            "createdAt": record.created_at,
            "token": token,
        }),
        |value| {
            println!("Created tenant {tenant_id}");
            println!();
            println!("  token: {}", value["token"].as_str().unwrap_or_default());
            println!();
            println!("Store this token now; it is shown exactly once.");
        },
    );
    Ok(())
}

pub(crate) fn list(registry: &TenantRegistry, json: bool) -> Result<()> {
    let ids = registry.list().context("failed to read tenant registry")?;
    let mut tenants = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(record) = registry.get(id)? {
            tenants.push(json!({
                "tenantId": id,
                "displayName": record.display_name,
                "disabled": record.disabled,
                "lastSeenAt": record.last_seen_at,
            }));
        }
    }

    emit(json, &json!({ "tenants": tenants }), |value| {
        let tenants = value["tenants"].as_array().cloned().unwrap_or_default();
        if tenants.is_empty() {
            println!("No tenants.");
            return;
        }
        for tenant in tenants {
            let id = tenant["tenantId"].as_str().unwrap_or_default();
            let disabled = if tenant["disabled"].as_bool().unwrap_or(false) {
                " (disabled)"
            } else {
                ""
            };
            match tenant["displayName"].as_str() {
                Some(name) => println!("{id}{disabled}  — {name}"),
                None => println!("{id}{disabled}"),
            }
        }
    });
    Ok(())
}

pub(crate) fn info(
    registry: &TenantRegistry,
    ledger: &UsageLedger,
    tenant_id: &str,
    json: bool,
) -> Result<()> {
    require_valid_tenant_id(tenant_id)?;
    let Some(record) = registry.get(tenant_id)? else {
        bail!("tenant not found: {tenant_id} — `gatehouse tenants list` shows known tenants");
    };
    let usage = ledger
        .load_usage(tenant_id)
        .context("failed to load usage snapshot")?;

    emit(
        json,
        &json!({
            "tenantId": tenant_id,
            "displayName": record.display_name,
            "disabled": record.disabled,
            "createdAt": record.created_at,
            "lastSeenAt": record.last_seen_at,
            "quotas": record.quotas,
            "usage": usage,
        }),
        |value| {
            println!("Tenant {tenant_id}");
            if let Some(name) = value["displayName"].as_str() {
                println!("  name:        {name}");
            }
            println!("  disabled:    {}", value["disabled"]);
            println!("  created:     {}", value["createdAt"]);
            println!(
                "  last seen:   {}",
                value["lastSeenAt"].as_str().unwrap_or("never")
            );
            println!("  period:      {}", value["usage"]["period"]);
            println!("  tokens used: {}", value["usage"]["totalTokens"]);
            println!("  cost cents:  {}", value["usage"]["costCents"]);
            println!("  requests:    {}", value["usage"]["requestsTotal"]);
        },
    );
    Ok(())
}

pub(crate) fn remove(
    registry: &TenantRegistry,
    tenant_id: &str,
    delete_data: bool,
    force: bool,
    json: bool,
) -> Result<()> {
    require_valid_tenant_id(tenant_id)?;
    if !force {
        let what = if delete_data {
            format!("Remove tenant {tenant_id} AND delete its data?")
        } else {
            format!("Remove tenant {tenant_id}? (state files are kept)")
        };
        if !confirm(&what)? {
            bail!("aborted");
        }
    }
    registry
        .remove(tenant_id, delete_data)
        .with_context(|| format!("failed to remove tenant {tenant_id}"))?;

    emit(
        json,
        &json!({ "removed": tenant_id, "deletedData": delete_data }),
        |_| println!("Removed tenant {tenant_id}"),
    );
    Ok(())
}

pub(crate) fn token(registry: &TenantRegistry, tenant_id: &str, json: bool) -> Result<()> {
    require_valid_tenant_id(tenant_id)?;
    let token = registry
        .rotate(tenant_id)
        .with_context(|| format!("failed to rotate token for {tenant_id}"))?;

    emit(
        json,
        &json!({ "tenantId": tenant_id, "token": token }),
        |value| {
            println!("Rotated token for {tenant_id}");
            println!();
            println!("  token: {}", value["token"].as_str().unwrap_or_default());
            println!();
            println!("The previous token no longer works.");
        },
    );
    Ok(())
}
