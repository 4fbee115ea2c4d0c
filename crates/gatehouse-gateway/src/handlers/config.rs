//! Tenant config overlay (`openclaw.json`).
//!
//! Tenants may read and write their own overlay, but admin-only keys are
//! stripped from tenant writes — quota envelopes and sandbox limits are
//! not self-service.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use gatehouse_core::{GatewayError, GatewayResult};

use crate::dispatch::Dispatcher;

/// Overlay keys a tenant may not set about itself.
const ADMIN_ONLY_KEYS: &[&str] = &["quotas", "sandbox", "backup"];

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct GetParams {
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetParams {
    #[serde(default)]
    tenant_id: Option<String>,
    config: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchParams {
    #[serde(default)]
    tenant_id: Option<String>,
    patch: Value,
}

fn require_object(value: &Value, what: &str) -> GatewayResult<Map<String, Value>> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| GatewayError::invalid_request(format!("{what} must be a JSON object")))
}

/// Strip admin-only keys from a tenant-authored overlay document.
fn strip_admin_keys(mut doc: Map<String, Value>, tenant_call: bool) -> Map<String, Value> {
    if tenant_call {
        for key in ADMIN_ONLY_KEYS {
            doc.remove(*key);
        }
    }
    doc
}

fn load_overlay(path: &std::path::Path) -> Map<String, Value> {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

fn save_overlay(path: &std::path::Path, doc: &Map<String, Value>) -> GatewayResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GatewayError::unavailable(format!("cannot write config: {e}")))?;
    }
    let bytes = serde_json::to_vec_pretty(doc)
        .map_err(|e| GatewayError::unavailable(format!("cannot serialize config: {e}")))?;
    std::fs::write(path, bytes)
        .map_err(|e| GatewayError::unavailable(format!("cannot write config: {e}")))
}

pub(super) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("config.get", |gateway, ctx| async move {
        let params: GetParams = ctx.params()?;
        let tenant_id = super::target_tenant(&ctx, params.tenant_id)?;
        let overlay = load_overlay(&gateway.layout.tenant_config_file(&tenant_id));
        Ok(Value::Object(overlay))
    });

    dispatcher.register("config.set", |gateway, ctx| async move {
        let params: SetParams = ctx.params()?;
        let tenant_id = super::target_tenant(&ctx, params.tenant_id)?;
        let tenant_call = ctx.conn.record().tenant.is_some();
        let doc = strip_admin_keys(require_object(&params.config, "config")?, tenant_call);
        save_overlay(&gateway.layout.tenant_config_file(&tenant_id), &doc)?;
        Ok(Value::Object(doc))
    });

    dispatcher.register("config.patch", |gateway, ctx| async move {
        let params: PatchParams = ctx.params()?;
        let tenant_id = super::target_tenant(&ctx, params.tenant_id)?;
        let tenant_call = ctx.conn.record().tenant.is_some();
        let patch = strip_admin_keys(require_object(&params.patch, "patch")?, tenant_call);

        let path = gateway.layout.tenant_config_file(&tenant_id);
        let mut doc = load_overlay(&path);
        for (key, value) in patch {
            if value.is_null() {
                doc.remove(&key);
            } else {
                doc.insert(key, value);
            }
        }
        save_overlay(&path, &doc)?;
        Ok(Value::Object(doc))
    });

    dispatcher.register("config.schema", |_gateway, _ctx| async move {
        Ok(overlay_schema())
    });
}

/// Static JSON schema of the tenant overlay document.
fn overlay_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Tenant configuration overlay",
        "type": "object",
        "properties": {
            "defaultAgent": {
                "type": "string",
                "description": "Agent used when a request names none."
            },
            "displayLocale": { "type": "string" },
            "notifications": {
                "type": "object",
                "properties": {
                    "cron": { "type": "boolean" },
                    "terminal": { "type": "boolean" }
                }
            },
            "quotas": {
                "type": "object",
                "description": "Admin-only: quota envelope overrides."
            },
            "sandbox": {
                "type": "object",
                "description": "Admin-only: sandbox resource limits."
            },
            "backup": {
                "type": "object",
                "description": "Admin-only: backup schedule overrides."
            }
        },
        "additionalProperties": true
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_admin_keys_for_tenants_only() {
        let doc: Map<String, Value> = serde_json::from_value(json!({
            "defaultAgent": "beta",
            "quotas": { "monthlyTokensHard": 1 },
            "sandbox": { "pids": 64 },
        }))
        .unwrap();

        let stripped = strip_admin_keys(doc.clone(), true);
        assert!(stripped.contains_key("defaultAgent"));
        assert!(!stripped.contains_key("quotas"));
        assert!(!stripped.contains_key("sandbox"));

        let admin = strip_admin_keys(doc, false);
        assert!(admin.contains_key("quotas"));
    }

    #[test]
    fn schema_names_admin_only_keys() {
        let schema = overlay_schema();
        for key in ADMIN_ONLY_KEYS {
            assert!(schema["properties"].get(*key).is_some(), "{key}");
        }
    }
}
