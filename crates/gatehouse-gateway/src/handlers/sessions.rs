//! Session transcript listing and preview, plus agent enumeration.
//!
//! Tenants see only their own subtree (`tenants/{id}/agents/...`); the
//! allow-list limits them to list/preview — transcripts are never writable
//! over RPC.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use gatehouse_core::{GatewayError, GatewayResult};

use crate::dispatch::Dispatcher;
use crate::handlers::target_tenant;

const DEFAULT_PREVIEW_LINES: usize = 20;
const MAX_PREVIEW_LINES: usize = 500;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListParams {
    tenant_id: Option<String>,
    agent_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewParams {
    #[serde(default)]
    tenant_id: Option<String>,
    agent_id: String,
    session: String,
    #[serde(default)]
    lines: Option<usize>,
}

/// A session file name must be a bare file name: no separators, no parent
/// references.
fn validate_file_name(name: &str) -> GatewayResult<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(GatewayError::invalid_request(format!(
            "invalid session name: {name:?}"
        )));
    }
    Ok(())
}

fn list_agent_sessions(dir: &std::path::Path, agent_id: &str, out: &mut Vec<Value>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        out.push(json!({
            "agentId": agent_id,
            "session": name,
            "sizeBytes": meta.len(),
            "modifiedAt": modified,
        }));
    }
}

pub(super) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("agents.list", |gateway, ctx| async move {
        let params: ListParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let mut agents = Vec::new();
        if let Ok(entries) = std::fs::read_dir(gateway.layout.agents_dir(&tenant_id)) {
            for entry in entries.filter_map(Result::ok) {
                if entry.file_type().is_ok_and(|t| t.is_dir()) {
                    agents.push(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        agents.sort();
        Ok(json!({ "agents": agents }))
    });

    dispatcher.register("sessions.list", |gateway, ctx| async move {
        let params: ListParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        let mut sessions = Vec::new();

        let agent_ids: Vec<String> = match params.agent_id {
            Some(agent) => vec![agent],
            None => {
                let mut agents = Vec::new();
                if let Ok(entries) = std::fs::read_dir(gateway.layout.agents_dir(&tenant_id)) {
                    for entry in entries.filter_map(Result::ok) {
                        if entry.file_type().is_ok_and(|t| t.is_dir()) {
                            agents.push(entry.file_name().to_string_lossy().to_string());
                        }
                    }
                }
                agents
            },
        };

        for agent_id in agent_ids {
            let dir = gateway.layout.agent_sessions_dir(&tenant_id, &agent_id);
            list_agent_sessions(&dir, &agent_id, &mut sessions);
        }
        Ok(json!({ "sessions": sessions }))
    });

    dispatcher.register("sessions.preview", |gateway, ctx| async move {
        let params: PreviewParams = ctx.params()?;
        let tenant_id = target_tenant(&ctx, params.tenant_id)?;
        validate_file_name(&params.session)?;
        validate_file_name(&params.agent_id)?;

        let path = gateway
            .layout
            .agent_sessions_dir(&tenant_id, &params.agent_id)
            .join(&params.session);
        let content = std::fs::read_to_string(&path).map_err(|_| {
            GatewayError::not_found(format!(
                "session not found: {}/{}",
                params.agent_id, params.session
            ))
        })?;

        let limit = params
            .lines
            .unwrap_or(DEFAULT_PREVIEW_LINES)
            .min(MAX_PREVIEW_LINES);
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(limit);
        let tail: Vec<&str> = all[start..].to_vec();
        Ok(json!({
            "agentId": params.agent_id,
            "session": params.session,
            "lines": tail,
            "totalLines": all.len(),
        }))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_validation() {
        assert!(validate_file_name("abc.jsonl").is_ok());
        assert!(validate_file_name("2025-06-01T10.jsonl").is_ok());
        for bad in ["", "a/b", "a\\b", "..", "../x", ".hidden"] {
            assert!(validate_file_name(bad).is_err(), "{bad}");
        }
    }
}
